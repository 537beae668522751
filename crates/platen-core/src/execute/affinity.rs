//! Dedicated-thread task executor.
//!
//! Guarantees that a factory-constructed instance and every operation on it
//! run on one fixed thread for the instance's entire lifetime, while callers
//! on arbitrary threads submit work through a FIFO queue and wait on
//! [`TaskHandle`]s.
//!
//! Forced termination of a thread does not exist in Rust (or anywhere,
//! safely), so `abort` is realized as the cooperative half of the contract:
//! queued items are discarded, the state flips to `Aborted`, and the
//! caller-supplied cleanup runs on the aborting thread — for an isolated
//! pipeline that cleanup kills the worker process hosting the in-flight
//! native call, which unblocks the dedicated thread through an IPC error.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, mpsc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::{Error, Result};

use super::task::{Promise, TaskHandle, result_slot};

/// Lifecycle of an executor. `Aborted` and `Disposed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    Running = 0,
    Draining = 1,
    Aborted = 2,
    Disposed = 3,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            2 => Self::Aborted,
            _ => Self::Disposed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Aborted | Self::Disposed)
    }
}

/// Idle wake-up interval for the queue wait.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One queued unit of work. Resolved exactly once: executed or discarded.
trait QueuedWork<I>: Send {
    fn run(self: Box<Self>, instance: &mut I);
    fn discard(self: Box<Self>);
}

struct WorkItem<R, F> {
    func: Option<F>,
    promise: Promise<R>,
}

impl<I, R, F> QueuedWork<I> for WorkItem<R, F>
where
    R: Send,
    F: FnOnce(&mut I) -> Result<R> + Send,
{
    fn run(mut self: Box<Self>, instance: &mut I) {
        let Some(func) = self.func.take() else { return };
        match catch_unwind(AssertUnwindSafe(|| func(instance))) {
            Ok(Ok(value)) => {
                self.promise.complete(value);
            }
            Ok(Err(Error::Cancelled)) => {
                self.promise.cancel();
            }
            Ok(Err(error)) => {
                self.promise.fault(error);
            }
            Err(_) => {
                self.promise
                    .fault(Error::Conversion("conversion task panicked".to_string()));
            }
        }
    }

    fn discard(self: Box<Self>) {
        self.promise.fault(Error::Closed);
    }
}

impl<R, F> Drop for WorkItem<R, F> {
    fn drop(&mut self) {
        // Backstop: an item dropped without running (queue torn down on an
        // exiting thread) must never strand its waiter.
        if !self.promise.is_resolved() {
            self.promise.fault(Error::Closed);
        }
    }
}

/// Slot holding the owned instance.
///
/// Confined to the dedicated thread: `install`, `with` and `take` check the
/// caller against the owner thread, and `busy` rejects reentrant access on
/// that thread (the engine is non-reentrant).
struct InstanceSlot<I> {
    cell: UnsafeCell<Option<I>>,
    busy: AtomicBool,
    owner: OnceLock<ThreadId>,
}

// SAFETY: the cell is only ever touched from the owner thread (checked at
// runtime in `with`/`take`), and `busy` excludes reentrant aliasing there.
unsafe impl<I: Send> Sync for InstanceSlot<I> {}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<I> InstanceSlot<I> {
    fn new() -> Self {
        Self {
            cell: UnsafeCell::new(None),
            busy: AtomicBool::new(false),
            owner: OnceLock::new(),
        }
    }

    /// Called once, by the dedicated thread, after the factory succeeds.
    fn install(&self, instance: I) {
        let _ = self.owner.set(thread::current().id());
        // SAFETY: owner thread, before any work item can run.
        unsafe { *self.cell.get() = Some(instance) };
    }

    fn is_owner_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn with<R>(&self, f: impl FnOnce(&mut I) -> R) -> Result<R> {
        if !self.is_owner_thread() {
            return Err(Error::Conversion(
                "engine instance touched off its dedicated thread".to_string(),
            ));
        }
        if self.busy.swap(true, Ordering::Acquire) {
            return Err(Error::Reentrant);
        }
        let _guard = BusyGuard(&self.busy);
        // SAFETY: owner thread with the busy flag held: exclusive access.
        match unsafe { &mut *self.cell.get() }.as_mut() {
            Some(instance) => Ok(f(instance)),
            None => Err(Error::Closed),
        }
    }

    fn take(&self) -> Option<I> {
        if !self.is_owner_thread() || self.busy.swap(true, Ordering::Acquire) {
            return None;
        }
        let _guard = BusyGuard(&self.busy);
        // SAFETY: owner thread with the busy flag held.
        unsafe { &mut *self.cell.get() }.take()
    }
}

struct Shared<I> {
    queue: Mutex<VecDeque<Box<dyn QueuedWork<I>>>>,
    available: Condvar,
    state: AtomicU8,
    slot: InstanceSlot<I>,
}

impl<I> Shared<I> {
    fn state(&self) -> ExecutorState {
        ExecutorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: &[ExecutorState], to: ExecutorState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !from.contains(&ExecutorState::from_u8(current)) {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Runs one owned instance on one dedicated thread, forever FIFO.
pub struct AffinityExecutor<I> {
    shared: Arc<Shared<I>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<I: Send + 'static> AffinityExecutor<I> {
    /// Spawn the dedicated thread and run `factory` on it.
    ///
    /// Blocks only until the factory has finished. A factory error (or
    /// panic) tears the thread down and surfaces here.
    pub fn spawn<F>(factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<I> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            state: AtomicU8::new(ExecutorState::Running as u8),
            slot: InstanceSlot::new(),
        });

        let thread_shared = shared.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("platen-affinity".to_string())
            .spawn(move || {
                match factory() {
                    Ok(instance) => {
                        thread_shared.slot.install(instance);
                        if ready_tx.send(Ok(())).is_err() {
                            return;
                        }
                        serve(&thread_shared);
                    }
                    Err(error) => {
                        let _ = ready_tx.send(Err(error));
                    }
                };
            })
            .map_err(|e| Error::Construction(format!("failed to spawn conversion thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                worker: Mutex::new(Some(handle)),
            }),
            Ok(Err(error)) => {
                let _ = handle.join();
                Err(error)
            }
            Err(_) => {
                // Factory panicked; the channel died with the thread.
                let _ = handle.join();
                Err(Error::Construction(
                    "conversion thread died during construction".to_string(),
                ))
            }
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.shared.state()
    }

    /// Items queued but not yet started.
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Enqueue `f` to run against the owned instance, FIFO. Returns
    /// immediately; the handle resolves with `f`'s result or fault.
    ///
    /// Fails with [`Error::Closed`] once the executor has left `Running`.
    /// When the caller already *is* the dedicated thread the call degrades
    /// to a direct call; if the instance is mid-operation at that point the
    /// handle resolves with [`Error::Reentrant`] instead of deadlocking.
    pub fn invoke<R, F>(&self, f: F) -> Result<TaskHandle<R>>
    where
        R: Send + 'static,
        F: FnOnce(&mut I) -> Result<R> + Send + 'static,
    {
        let (promise, handle) = result_slot();
        self.submit(promise, f)?;
        Ok(handle)
    }

    /// [`invoke`](Self::invoke) with a caller-supplied promise, so another
    /// writer (a cancellation callback) can race to resolve the same slot.
    pub(crate) fn submit<R, F>(&self, promise: Promise<R>, f: F) -> Result<()>
    where
        R: Send + 'static,
        F: FnOnce(&mut I) -> Result<R> + Send + 'static,
    {
        if self.shared.state() != ExecutorState::Running {
            return Err(Error::Closed);
        }

        if self.shared.slot.is_owner_thread() {
            // Direct call; `busy` only changes on this thread, so the check
            // cannot race.
            if self.shared.slot.is_busy() {
                promise.fault(Error::Reentrant);
                return Ok(());
            }
            let item = Box::new(WorkItem {
                func: Some(f),
                promise,
            });
            return self.shared.slot.with(|instance| item.run(instance)).map(|_| ());
        }

        let mut queue = self.shared.queue.lock().unwrap();
        // Re-check under the queue lock so an abort cannot slip between the
        // state check and the push.
        if self.shared.state() != ExecutorState::Running {
            return Err(Error::Closed);
        }
        queue.push_back(Box::new(WorkItem {
            func: Some(f),
            promise,
        }));
        self.shared.available.notify_one();
        Ok(())
    }

    /// Discard all queued items (their handles resolve `Closed`), mark the
    /// executor `Aborted`, run `cleanup` on the calling thread, and detach
    /// the dedicated thread rather than join it.
    ///
    /// Last resort: an in-flight operation is abandoned, not interrupted —
    /// `cleanup` is expected to destroy whatever the thread is blocked on
    /// (the isolation boundary's worker process). Never use this to recover
    /// an instance that will be reused. No-op once terminal.
    pub fn abort(&self, cleanup: impl FnOnce()) {
        if !self
            .shared
            .transition(&[ExecutorState::Running, ExecutorState::Draining], ExecutorState::Aborted)
        {
            return;
        }
        tracing::debug!("aborting conversion executor");

        let discarded: Vec<_> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for item in discarded {
            item.discard();
        }
        self.shared.available.notify_all();

        cleanup();

        // Detach: the thread may be stuck in a native call that only ends
        // when the cleanup above destroys its host.
        drop(self.worker.lock().unwrap().take());
    }

    /// Stop accepting work, let already-queued items finish, drop the owned
    /// instance on the dedicated thread, and join it. No-op once terminal.
    pub fn dispose(&self) {
        if !self
            .shared
            .transition(&[ExecutorState::Running], ExecutorState::Draining)
            && self.shared.state() != ExecutorState::Draining
        {
            return;
        }
        self.shared.available.notify_all();

        if self.shared.slot.is_owner_thread() {
            // Dispose from inside a work item: the loop drains after the
            // current item returns; joining here would deadlock.
            return;
        }
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl<I> Drop for AffinityExecutor<I> {
    fn drop(&mut self) {
        if !self.shared.state().is_terminal() {
            self.shared
                .transition(&[ExecutorState::Running], ExecutorState::Draining);
            self.shared.available.notify_all();
            if let Some(handle) = self.worker.lock().unwrap().take()
                && !self.shared.slot.is_owner_thread()
            {
                let _ = handle.join();
            }
        }
    }
}

/// The dedicated thread's serve loop.
fn serve<I>(shared: &Shared<I>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.state() == ExecutorState::Aborted {
                    drop(queue);
                    // Cleanup already ran on the aborting thread; drop the
                    // instance here so its teardown stays thread-affine.
                    drop(shared.slot.take());
                    return;
                }
                if let Some(item) = queue.pop_front() {
                    break item;
                }
                if shared.state() == ExecutorState::Draining {
                    drop(queue);
                    drop(shared.slot.take());
                    shared.state.store(ExecutorState::Disposed as u8, Ordering::Release);
                    return;
                }
                let (reacquired, _) = shared
                    .available
                    .wait_timeout(queue, POLL_INTERVAL)
                    .unwrap();
                queue = reacquired;
            }
        };

        // Item-level faults are captured inside `run`; nothing escapes to
        // kill this thread.
        if let Err(error) = shared.slot.with(|instance| item.run(instance)) {
            // Unrecoverable: the instance is gone. Fail everything queued
            // and mark the executor aborted.
            tracing::error!("conversion thread lost its instance: {}", error);
            shared.transition(
                &[ExecutorState::Running, ExecutorState::Draining],
                ExecutorState::Aborted,
            );
            let discarded: Vec<_> = shared.queue.lock().unwrap().drain(..).collect();
            for item in discarded {
                item.discard();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct Recorder {
        calls: Arc<AtomicUsize>,
        dropped_on: Arc<Mutex<Option<ThreadId>>>,
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            *self.dropped_on.lock().unwrap() = Some(thread::current().id());
        }
    }

    fn recorder() -> (Arc<AtomicUsize>, Arc<Mutex<Option<ThreadId>>>, AffinityExecutor<Recorder>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let dropped_on = Arc::new(Mutex::new(None));
        let calls_clone = calls.clone();
        let dropped_clone = dropped_on.clone();
        let executor = AffinityExecutor::spawn(move || {
            Ok(Recorder {
                calls: calls_clone,
                dropped_on: dropped_clone,
            })
        })
        .unwrap();
        (calls, dropped_on, executor)
    }

    #[test]
    fn test_factory_error_propagates() {
        let result = AffinityExecutor::<Recorder>::spawn(|| {
            Err(Error::Construction("engine missing".to_string()))
        });
        assert!(matches!(result, Err(Error::Construction(_))));
    }

    #[test]
    fn test_factory_panic_becomes_construction_error() {
        let result = AffinityExecutor::<Recorder>::spawn(|| panic!("factory exploded"));
        assert!(matches!(result, Err(Error::Construction(_))));
    }

    #[test]
    fn test_invocations_run_in_submission_order() {
        let (_, _, executor) = recorder();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let order = order.clone();
                executor
                    .invoke(move |instance: &mut Recorder| {
                        instance.calls.fetch_add(1, Ordering::SeqCst);
                        order.lock().unwrap().push(i);
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.wait().unwrap(), i);
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_all_work_runs_on_one_thread() {
        let (_, _, executor) = recorder();
        let first = executor
            .invoke(|_| Ok(thread::current().id()))
            .unwrap()
            .wait()
            .unwrap();
        let second = executor
            .invoke(|_| Ok(thread::current().id()))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(first, second);
        assert_ne!(first, thread::current().id());
    }

    #[test]
    fn test_item_fault_does_not_kill_the_thread() {
        let (calls, _, executor) = recorder();
        let faulted = executor
            .invoke(|_: &mut Recorder| -> Result<u32> {
                Err(Error::Conversion("bad page".to_string()))
            })
            .unwrap();
        assert!(matches!(faulted.wait(), Err(Error::Conversion(_))));

        let ok = executor
            .invoke(|instance: &mut Recorder| {
                instance.calls.fetch_add(1, Ordering::SeqCst);
                Ok(5u32)
            })
            .unwrap();
        assert_eq!(ok.wait().unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_item_panic_is_captured() {
        let (_, _, executor) = recorder();
        let handle = executor
            .invoke(|_: &mut Recorder| -> Result<u32> { panic!("mid-conversion") })
            .unwrap();
        assert!(matches!(handle.wait(), Err(Error::Conversion(_))));
        assert_eq!(executor.state(), ExecutorState::Running);
    }

    #[test]
    fn test_dispose_drains_queued_items_and_drops_on_worker_thread() {
        let (calls, dropped_on, executor) = recorder();
        let worker_thread = executor
            .invoke(|_| Ok(thread::current().id()))
            .unwrap()
            .wait()
            .unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                executor
                    .invoke(|instance: &mut Recorder| {
                        thread::sleep(Duration::from_millis(5));
                        instance.calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        executor.dispose();
        assert_eq!(executor.state(), ExecutorState::Disposed);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*dropped_on.lock().unwrap(), Some(worker_thread));
    }

    #[test]
    fn test_invoke_after_dispose_fails_closed() {
        let (_, _, executor) = recorder();
        executor.dispose();
        let result = executor.invoke(|_: &mut Recorder| Ok(()));
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[test]
    fn test_abort_discards_queued_items() {
        let (calls, _, executor) = recorder();

        // Occupy the thread so the rest of the batch stays queued.
        let gate = Arc::new(AtomicBool::new(false));
        let gate_clone = gate.clone();
        let running = executor
            .invoke(move |_: &mut Recorder| {
                while !gate_clone.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            })
            .unwrap();

        let queued: Vec<_> = (0..4)
            .map(|_| {
                executor
                    .invoke(|instance: &mut Recorder| {
                        instance.calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_clone = cleaned.clone();
        executor.abort(move || cleaned_clone.store(true, Ordering::SeqCst));
        assert_eq!(executor.state(), ExecutorState::Aborted);
        assert!(cleaned.load(Ordering::SeqCst));

        for handle in queued {
            assert!(matches!(handle.wait(), Err(Error::Closed)));
        }
        assert!(matches!(executor.invoke(|_: &mut Recorder| Ok(())), Err(Error::Closed)));

        // The in-flight item was abandoned, not interrupted.
        gate.store(true, Ordering::SeqCst);
        let _ = running.wait();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_is_idempotent() {
        let (_, _, executor) = recorder();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            executor.abort(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_invoke_faults_instead_of_deadlocking() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dropped_on = Arc::new(Mutex::new(None));
        let calls_clone = calls.clone();
        let dropped_clone = dropped_on.clone();
        let executor = Arc::new(
            AffinityExecutor::spawn(move || {
                Ok(Recorder {
                    calls: calls_clone,
                    dropped_on: dropped_clone,
                })
            })
            .unwrap(),
        );

        let inner_executor = executor.clone();
        let handle = executor
            .invoke(move |_: &mut Recorder| {
                // From the dedicated thread, mid-operation: must fail fast.
                let nested = inner_executor.invoke(|_: &mut Recorder| Ok(1u32))?;
                nested.wait()
            })
            .unwrap();
        assert!(matches!(handle.wait(), Err(Error::Reentrant)));
    }
}
