// Licensed under the MIT license.

//! Operating-system abstraction. These
//! primitives are external collaborators — the engine is generic over the
//! [`Os`] trait, and [`StdOs`] is the concrete, std-backed implementation
//! used by the public constructor and the test suite.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore: `release` increments, `wait` blocks until the count
/// is nonzero then decrements it. `wait(0)` blocks with no timeout.
pub trait Semaphore: Send + Sync {
    /// Returns `true` if the semaphore was acquired, `false` on timeout.
    fn wait(&self, timeout_ms: u32) -> bool;
    fn release(&self);
}

/// Thread/clock/semaphore factory. One implementation (`StdOs`) ships with
/// the crate; the trait exists so an embedded target could substitute an
/// RTOS-backed equivalent without touching the dispatcher or parser.
pub trait Os: Clone + Send + Sync + 'static {
    type Sem: Semaphore + 'static;

    fn new_semaphore(&self, initial_count: usize) -> Arc<Self::Sem>;
    fn spawn(&self, name: &'static str, f: impl FnOnce() + Send + 'static);
    fn now_ms(&self) -> u64;
}

/// A bounded mailbox: single-producer-or-multi-producer, single-consumer
/// message queue, backed by `crossbeam_channel`. Exposes a
/// create/put/put_now/get(ms) contract.
pub struct Mailbox<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Mailbox { tx, rx }
    }

    pub fn sender(&self) -> MailboxSender<T> {
        MailboxSender(self.tx.clone())
    }

    /// Blocking put; waits for room if the mailbox is full.
    pub fn put(&self, msg: T) {
        let _ = self.tx.send(msg);
    }

    /// Non-blocking put ("put_now"); returns the message back on failure.
    pub fn try_put(&self, msg: T) -> Result<(), T> {
        self.tx.try_send(msg).map_err(|e| e.into_inner())
    }

    /// Blocks up to `timeout_ms` for a message (`0` = infinite).
    pub fn get(&self, timeout_ms: u32) -> Option<T> {
        if timeout_ms == 0 {
            self.rx.recv().ok()
        } else {
            match self.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)) {
                Ok(v) => Some(v),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            }
        }
    }
}

/// A cloneable handle for producers to enqueue onto a [`Mailbox`].
#[derive(Clone)]
pub struct MailboxSender<T>(Sender<T>);

impl<T> MailboxSender<T> {
    pub fn put(&self, msg: T) {
        let _ = self.0.send(msg);
    }

    pub fn try_put(&self, msg: T) -> Result<(), T> {
        self.0.try_send(msg).map_err(|e| e.into_inner())
    }
}

/// `std`-backed counting semaphore: `Mutex<usize>` + `Condvar`.
pub struct StdSemaphore {
    state: Mutex<usize>,
    cv: Condvar,
}

impl StdSemaphore {
    pub fn new(initial_count: usize) -> Self {
        StdSemaphore { state: Mutex::new(initial_count), cv: Condvar::new() }
    }
}

impl Semaphore for StdSemaphore {
    fn wait(&self, timeout_ms: u32) -> bool {
        let mut count = self.state.lock().unwrap();
        if timeout_ms == 0 {
            while *count == 0 {
                count = self.cv.wait(count).unwrap();
            }
            *count -= 1;
            true
        } else {
            let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            while *count == 0 {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, result) = self.cv.wait_timeout(count, deadline - now).unwrap();
                count = guard;
                if result.timed_out() && *count == 0 {
                    return false;
                }
            }
            *count -= 1;
            true
        }
    }

    fn release(&self) {
        let mut count = self.state.lock().unwrap();
        *count += 1;
        self.cv.notify_one();
    }
}

/// Default, std-library-backed [`Os`] implementation.
#[derive(Clone, Default)]
pub struct StdOs;

impl Os for StdOs {
    type Sem = StdSemaphore;

    fn new_semaphore(&self, initial_count: usize) -> Arc<Self::Sem> {
        Arc::new(StdSemaphore::new(initial_count))
    }

    fn spawn(&self, name: &'static str, f: impl FnOnce() + Send + 'static) {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("failed to spawn engine thread");
    }

    fn now_ms(&self) -> u64 {
        use std::time::SystemTime;
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn semaphore_wait_blocks_until_release() {
        let sem = Arc::new(StdSemaphore::new(0));
        let sem2 = sem.clone();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            done2.store(1, Ordering::SeqCst);
            sem2.release();
        });
        assert!(sem.wait(0));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn semaphore_wait_times_out() {
        let sem = StdSemaphore::new(0);
        assert!(!sem.wait(10));
    }

    #[test]
    fn mailbox_fifo_order() {
        let mb: Mailbox<u32> = Mailbox::new(4);
        mb.put(1);
        mb.put(2);
        mb.put(3);
        assert_eq!(mb.get(0), Some(1));
        assert_eq!(mb.get(0), Some(2));
        assert_eq!(mb.get(0), Some(3));
    }

    #[test]
    fn mailbox_get_times_out_when_empty() {
        let mb: Mailbox<u32> = Mailbox::new(1);
        assert_eq!(mb.get(10), None);
    }
}
