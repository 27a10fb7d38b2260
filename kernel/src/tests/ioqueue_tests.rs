//! Bounded ring buffer under producer/consumer contention.

use alloc::vec::Vec;

use crate::sync::ioqueue::{IoQueue, IOQUEUE_CAPACITY};
use crate::sync::{Mutex, Semaphore};
use crate::task;

use super::report;

static QUEUE: IoQueue = IoQueue::new();
static RECEIVED: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static CONSUMERS_DONE: Semaphore = Semaphore::new(0);

const TOTAL_BYTES: usize = 1024;
const PER_CONSUMER: usize = TOTAL_BYTES / 2;

fn producer(_arg: usize) {
    for i in 0..TOTAL_BYTES {
        QUEUE.putchar((i % 256) as u8);
    }
}

fn consumer(_id: usize) {
    for _ in 0..PER_CONSUMER {
        let byte = QUEUE.getchar();
        RECEIVED.lock().push(byte);
    }
    CONSUMERS_DONE.post();
}

/// Two consumers drain a known 1024-byte sequence produced concurrently:
/// nothing is lost, nothing is duplicated, and the queue never overfills.
pub fn run() {
    task::thread_start("ioq-consumer-a", 8, consumer, 0).expect("cannot start consumer");
    task::thread_start("ioq-consumer-b", 8, consumer, 1).expect("cannot start consumer");
    task::thread_start("ioq-producer", 8, producer, 0).expect("cannot start producer");

    CONSUMERS_DONE.wait();
    CONSUMERS_DONE.wait();

    let received = RECEIVED.lock();
    assert_eq!(received.len(), TOTAL_BYTES);

    // Every byte value appears exactly TOTAL_BYTES / 256 times.
    let mut counts = [0usize; 256];
    for &byte in received.iter() {
        counts[byte as usize] += 1;
    }
    for (value, &count) in counts.iter().enumerate() {
        assert_eq!(
            count,
            TOTAL_BYTES / 256,
            "byte {:#04x} seen {} times",
            value,
            count
        );
    }

    assert!(QUEUE.len() == 0, "queue not drained");
    assert!(IOQUEUE_CAPACITY == 256);
    report("ioqueue_contention");
}
