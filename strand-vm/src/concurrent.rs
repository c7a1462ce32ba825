//! Concurrency primitives exposed to the language: channels, locks and
//! task completion handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::{VmError, VmResult};
use crate::value::Value;

/// A FIFO channel value. Capacity 0 is a rendezvous channel: a send blocks
/// until a matching receive arrives.
pub struct ChannelValue {
    sender: Mutex<Option<Sender<Value>>>,
    receiver: Receiver<Value>,
}

impl ChannelValue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }

    /// Blocking send; raises once the channel has been closed.
    pub fn send(&self, value: Value) -> VmResult<()> {
        // Clone the sender out so the lock is not held while blocking.
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(value)
                .map_err(|_| VmError::raise("send on closed channel")),
            None => Err(VmError::raise("send on closed channel")),
        }
    }

    /// Blocking receive; a closed, drained channel yields nil.
    pub fn recv(&self) -> Value {
        self.receiver.recv().unwrap_or(Value::Nil)
    }

    /// Receive until the channel is closed and drained.
    pub fn recv_open(&self) -> Option<Value> {
        self.receiver.recv().ok()
    }

    pub fn close(&self) {
        self.sender.lock().take();
    }
}

impl fmt::Debug for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelValue")
            .field("closed", &self.sender.lock().is_none())
            .finish()
    }
}

/// A mutual-exclusion lock with explicit acquire/release, usable across
/// separate native calls (unlike a guard-scoped mutex).
pub struct LockValue {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl LockValue {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut locked = self.locked.lock();
        while *locked {
            self.cond.wait(&mut locked);
        }
        *locked = true;
    }

    pub fn release(&self) {
        *self.locked.lock() = false;
        self.cond.notify_one();
    }

    /// The `lock` member: with a function argument, runs it under the
    /// lock; without one, acquires and leaves the lock held.
    pub fn lock_fn(lock: Arc<LockValue>) -> Value {
        Value::native("lock", move |vm, args| match args.first() {
            Some(f @ Value::Function(_)) => {
                lock.acquire();
                let result = vm.run_function(f.clone(), &[]);
                lock.release();
                result.map(|_| Value::Nil)
            }
            Some(other) => Err(VmError::raise(format!(
                "invalid argument type {}, expected function",
                other.type_name()
            ))),
            None => {
                lock.acquire();
                Ok(Value::Nil)
            }
        })
    }

    pub fn unlock_fn(lock: Arc<LockValue>) -> Value {
        Value::native("unlock", move |_vm, _args| {
            lock.release();
            Ok(Value::Nil)
        })
    }
}

impl Default for LockValue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockValue").finish()
    }
}

/// One-shot completion cell for a fiber. Completion and cancellation are
/// mutually exclusive and idempotent: the first of the two wins.
pub struct TaskHandle {
    result: Mutex<Option<Value>>,
    cond: Condvar,
    finished: AtomicBool,
    /// The running flag of the VM executing this task.
    stop: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
            finished: AtomicBool::new(false),
            stop,
        }
    }

    /// Deliver the task's value. Returns false if the task already
    /// finished (completed or cancelled).
    pub fn complete(&self, value: Value) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.result.lock() = Some(value);
        self.cond.notify_all();
        true
    }

    /// Best-effort cancel: stops the VM's fetch loop and resolves the task
    /// to nil. A task that already completed is left untouched.
    pub fn cancel(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        *self.result.lock() = Some(Value::Nil);
        self.cond.notify_all();
    }

    /// Block until the task resolves.
    pub fn wait(&self) -> Value {
        let mut result = self.result.lock();
        while result.is_none() {
            self.cond.wait(&mut result);
        }
        result.as_ref().cloned().unwrap_or(Value::Nil)
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.finished.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffered_channel_preserves_order() {
        let ch = ChannelValue::new(4);
        for i in 0..4 {
            ch.send(Value::Int(i)).unwrap();
        }
        for i in 0..4 {
            assert!(matches!(ch.recv(), Value::Int(v) if v == i));
        }
    }

    #[test]
    fn rendezvous_send_blocks_until_recv() {
        let ch = Arc::new(ChannelValue::new(0));
        let sender = ch.clone();
        let handle = thread::spawn(move || sender.send(Value::Int(7)).unwrap());
        thread::sleep(Duration::from_millis(10));
        assert!(matches!(ch.recv(), Value::Int(7)));
        handle.join().unwrap();
    }

    #[test]
    fn closed_channel_recv_yields_nil_and_send_raises() {
        let ch = ChannelValue::new(1);
        ch.send(Value::Int(1)).unwrap();
        ch.close();
        assert!(matches!(ch.recv(), Value::Int(1)));
        assert!(matches!(ch.recv(), Value::Nil));
        assert!(ch.send(Value::Int(2)).is_err());
    }

    #[test]
    fn task_completion_is_once_only() {
        let task = TaskHandle::new(Arc::new(AtomicBool::new(true)));
        assert!(task.complete(Value::Int(1)));
        assert!(!task.complete(Value::Int(2)));
        assert!(matches!(task.wait(), Value::Int(1)));
    }

    #[test]
    fn cancel_after_completion_keeps_value() {
        let running = Arc::new(AtomicBool::new(true));
        let task = TaskHandle::new(running.clone());
        task.complete(Value::Int(5));
        task.cancel();
        assert!(matches!(task.wait(), Value::Int(5)));
        // the vm keeps running; cancel lost the race
        assert!(running.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_stops_the_vm_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let task = TaskHandle::new(running.clone());
        task.cancel();
        assert!(!running.load(Ordering::SeqCst));
        assert!(matches!(task.wait(), Value::Nil));
    }

    #[test]
    fn lock_excludes() {
        let lock = LockValue::new();
        lock.acquire();
        lock.release();
        lock.acquire();
        lock.release();
    }
}
