//! IDT, 8259A PIC, and the common interrupt dispatch path.
//!
//! Every vector funnels through one assembly prologue that builds an
//! [`InterruptFrame`] on the interrupted task's kernel stack and calls
//! `interrupt_dispatch`. Device handlers are plain Rust functions registered
//! at init time with [`register_handler`]; the timer handler may call
//! `schedule()` from inside dispatch, in which case the frame simply stays
//! parked on the outgoing task's stack until it is scheduled again and
//! returns through `intr_exit`.

use core::arch::global_asm;
use core::mem::size_of;

use spin::Mutex;

use crate::arch::VirtAddr;
use crate::gdt;

/// Number of CPU/PIC vectors with installed gates (0x00..=0x2F).
pub const IDT_HW_ENTRIES: usize = 0x30;
/// The IDT itself spans up to the syscall gate.
const IDT_ENTRIES: usize = 0x81;

pub const TIMER_VECTOR: u8 = 0x20;
pub const KEYBOARD_VECTOR: u8 = 0x21;
pub const IDE_PRIMARY_VECTOR: u8 = 0x2E;
pub const IDE_SECONDARY_VECTOR: u8 = 0x2F;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Saved CPU state, in push order of the common prologue.
///
/// `user_esp`/`user_ss` are only present (and only restored by `iretd`) when
/// the interrupt arrived from ring 3.
#[repr(C)]
pub struct InterruptFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub vec_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub user_ss: u32,
}

pub type InterruptHandler = fn(&mut InterruptFrame);

static HANDLERS: Mutex<[Option<InterruptHandler>; IDT_ENTRIES]> =
    Mutex::new([None; IDT_ENTRIES]);

static EXCEPTION_NAMES: [&str; 21] = [
    "Division by zero",
    "Debug",
    "Non-maskable interrupt",
    "Breakpoint",
    "Overflow",
    "Bound range exceeded",
    "Invalid opcode",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack-segment fault",
    "General protection fault",
    "Page fault",
    "Reserved",
    "x87 floating-point exception",
    "Alignment check",
    "Machine check",
    "SIMD floating-point exception",
    "Virtualization exception",
];

// ---------------------------------------------------------------------------
// Entry stubs
// ---------------------------------------------------------------------------

// Vectors 8, 10-14 and 17 get a CPU-pushed error code; every other stub
// pushes a zero placeholder so the frame layout is uniform.
macro_rules! interrupt_stub {
    ($vec:literal) => {
        global_asm!(
            concat!(".global isr_stub_", $vec),
            concat!("isr_stub_", $vec, ":"),
            "push 0",
            concat!("push ", $vec),
            "jmp isr_common",
        );
    };
    ($vec:literal, err) => {
        global_asm!(
            concat!(".global isr_stub_", $vec),
            concat!("isr_stub_", $vec, ":"),
            concat!("push ", $vec),
            "jmp isr_common",
        );
    };
}

interrupt_stub!(0);
interrupt_stub!(1);
interrupt_stub!(2);
interrupt_stub!(3);
interrupt_stub!(4);
interrupt_stub!(5);
interrupt_stub!(6);
interrupt_stub!(7);
interrupt_stub!(8, err);
interrupt_stub!(9);
interrupt_stub!(10, err);
interrupt_stub!(11, err);
interrupt_stub!(12, err);
interrupt_stub!(13, err);
interrupt_stub!(14, err);
interrupt_stub!(15);
interrupt_stub!(16);
interrupt_stub!(17, err);
interrupt_stub!(18);
interrupt_stub!(19);
interrupt_stub!(20);
interrupt_stub!(21);
interrupt_stub!(22);
interrupt_stub!(23);
interrupt_stub!(24);
interrupt_stub!(25);
interrupt_stub!(26);
interrupt_stub!(27);
interrupt_stub!(28);
interrupt_stub!(29);
interrupt_stub!(30);
interrupt_stub!(31);
interrupt_stub!(32);
interrupt_stub!(33);
interrupt_stub!(34);
interrupt_stub!(35);
interrupt_stub!(36);
interrupt_stub!(37);
interrupt_stub!(38);
interrupt_stub!(39);
interrupt_stub!(40);
interrupt_stub!(41);
interrupt_stub!(42);
interrupt_stub!(43);
interrupt_stub!(44);
interrupt_stub!(45);
interrupt_stub!(46);
interrupt_stub!(47);
interrupt_stub!(128);

// The shared prologue/epilogue. `intr_exit` is a global symbol: starting a
// ring-3 process works by pointing ESP at a hand-built frame and jumping
// here (see `process::start`).
global_asm!(
    ".global isr_common",
    ".global intr_exit",
    "isr_common:",
    "push ds",
    "push es",
    "push fs",
    "push gs",
    "pushad",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov fs, ax",
    "mov gs, ax",
    "push esp",
    "call interrupt_dispatch",
    "add esp, 4",
    "intr_exit:",
    "popad",
    "pop gs",
    "pop fs",
    "pop es",
    "pop ds",
    "add esp, 8",
    "iretd",
);

global_asm!(
    ".global ISR_STUB_TABLE",
    ".align 4",
    "ISR_STUB_TABLE:",
    ".long isr_stub_0",
    ".long isr_stub_1",
    ".long isr_stub_2",
    ".long isr_stub_3",
    ".long isr_stub_4",
    ".long isr_stub_5",
    ".long isr_stub_6",
    ".long isr_stub_7",
    ".long isr_stub_8",
    ".long isr_stub_9",
    ".long isr_stub_10",
    ".long isr_stub_11",
    ".long isr_stub_12",
    ".long isr_stub_13",
    ".long isr_stub_14",
    ".long isr_stub_15",
    ".long isr_stub_16",
    ".long isr_stub_17",
    ".long isr_stub_18",
    ".long isr_stub_19",
    ".long isr_stub_20",
    ".long isr_stub_21",
    ".long isr_stub_22",
    ".long isr_stub_23",
    ".long isr_stub_24",
    ".long isr_stub_25",
    ".long isr_stub_26",
    ".long isr_stub_27",
    ".long isr_stub_28",
    ".long isr_stub_29",
    ".long isr_stub_30",
    ".long isr_stub_31",
    ".long isr_stub_32",
    ".long isr_stub_33",
    ".long isr_stub_34",
    ".long isr_stub_35",
    ".long isr_stub_36",
    ".long isr_stub_37",
    ".long isr_stub_38",
    ".long isr_stub_39",
    ".long isr_stub_40",
    ".long isr_stub_41",
    ".long isr_stub_42",
    ".long isr_stub_43",
    ".long isr_stub_44",
    ".long isr_stub_45",
    ".long isr_stub_46",
    ".long isr_stub_47",
);

extern "C" {
    static ISR_STUB_TABLE: [u32; IDT_HW_ENTRIES];
    fn isr_stub_128();
    fn intr_exit();
}

/// Virtual address of the `intr_exit` epilogue.
pub fn intr_exit_addr() -> VirtAddr {
    VirtAddr::new(intr_exit as usize as u32)
}

// ---------------------------------------------------------------------------
// IDT
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    attributes: u8,
    offset_high: u16,
}

impl GateDescriptor {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            attributes: 0,
            offset_high: 0,
        }
    }

    fn interrupt_gate(offset: u32, dpl: u8) -> Self {
        Self {
            offset_low: (offset & 0xFFFF) as u16,
            selector: gdt::KERNEL_CODE_SELECTOR,
            reserved: 0,
            // present | DPL | 32-bit interrupt gate
            attributes: 0x8E | (dpl << 5),
            offset_high: (offset >> 16) as u16,
        }
    }
}

static mut IDT: [GateDescriptor; IDT_ENTRIES] = [GateDescriptor::missing(); IDT_ENTRIES];

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

/// Install gates for vectors 0x00..=0x2F and the ring-3 syscall gate, remap
/// the PIC, and load the IDT. Interrupts stay disabled; `init_all` enables
/// them once every subsystem is up.
pub fn init() {
    unsafe {
        let idt = core::ptr::addr_of_mut!(IDT);
        for (vec, &stub) in ISR_STUB_TABLE.iter().enumerate() {
            (*idt)[vec] = GateDescriptor::interrupt_gate(stub, 0);
        }
        // `int 0x80` must be reachable from ring 3.
        (*idt)[SYSCALL_VECTOR as usize] =
            GateDescriptor::interrupt_gate(isr_stub_128 as usize as u32, 3);

        pic::init();

        let pointer = IdtPointer {
            limit: (IDT_ENTRIES * size_of::<GateDescriptor>() - 1) as u16,
            base: core::ptr::addr_of!(IDT) as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &pointer);
    }
    log::info!("IDT loaded ({} hardware vectors + syscall gate)", IDT_HW_ENTRIES);
}

/// Register `handler` for interrupt vector `vec`.
///
/// Masks interrupts while holding the table lock: dispatch takes the same
/// lock from interrupt context, and a spinning ISR would never yield back
/// to a preempted holder.
pub fn register_handler(vec: u8, handler: InterruptHandler) {
    crate::arch::instructions::interrupts::without_interrupts(|| {
        HANDLERS.lock()[vec as usize] = Some(handler);
    });
}

#[no_mangle]
extern "C" fn interrupt_dispatch(frame: &mut InterruptFrame) {
    let vec = frame.vec_no as usize;

    // Acknowledge the PIC before running the handler: the timer handler may
    // context-switch away and not return here for a long time.
    if (0x20..0x30).contains(&vec) {
        pic::end_of_interrupt(vec as u8);
    }

    // Copy the handler out so no lock is held across it.
    let handler = HANDLERS.lock()[vec];
    if let Some(handler) = handler {
        handler(frame);
        return;
    }

    // Spurious IRQ7 / IRQ15.
    if vec == 0x27 || vec == 0x2F {
        return;
    }

    if vec < EXCEPTION_NAMES.len() {
        panic!(
            "CPU exception {}: {} (err={:#x}, eip={:#x})",
            vec, EXCEPTION_NAMES[vec], frame.err_code, frame.eip
        );
    }
    log::warn!("Unhandled interrupt vector {:#x}", vec);
}

// ---------------------------------------------------------------------------
// 8259A PIC
// ---------------------------------------------------------------------------

mod pic {
    use crate::arch::port::Port;

    const PIC_M_CTRL: u16 = 0x20;
    const PIC_M_DATA: u16 = 0x21;
    const PIC_S_CTRL: u16 = 0xA0;
    const PIC_S_DATA: u16 = 0xA1;

    const EOI: u8 = 0x20;

    /// Remap the PICs to vectors 0x20/0x28 and unmask timer, keyboard,
    /// cascade, and both IDE lines.
    pub(super) fn init() {
        unsafe {
            let mut m_ctrl = Port::<u8>::new(PIC_M_CTRL);
            let mut m_data = Port::<u8>::new(PIC_M_DATA);
            let mut s_ctrl = Port::<u8>::new(PIC_S_CTRL);
            let mut s_data = Port::<u8>::new(PIC_S_DATA);

            // ICW1: edge triggered, cascade, expect ICW4
            m_ctrl.write(0x11);
            m_data.write(0x20); // ICW2: master base vector
            m_data.write(0x04); // ICW3: slave on IR2
            m_data.write(0x01); // ICW4: 8086 mode, manual EOI

            s_ctrl.write(0x11);
            s_data.write(0x28); // ICW2: slave base vector
            s_data.write(0x02); // ICW3: cascade identity
            s_data.write(0x01);

            // OCW1 masks: IRQ0 (timer), IRQ1 (keyboard), IRQ2 (cascade) on
            // the master; IRQ14/IRQ15 (IDE) on the slave.
            m_data.write(0xF8);
            s_data.write(0x3F);
        }
        log::info!("PIC remapped to 0x20/0x28");
    }

    pub(super) fn end_of_interrupt(vec: u8) {
        unsafe {
            if vec >= 0x28 {
                Port::<u8>::new(PIC_S_CTRL).write(EOI);
            }
            Port::<u8>::new(PIC_M_CTRL).write(EOI);
        }
    }
}
