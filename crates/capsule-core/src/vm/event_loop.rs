//! Per-execution event loop.
//!
//! Boa's `Context` is not safe for concurrent access, so every capability
//! that completes on another thread (timers firing, inbound HTTP requests,
//! promise settlement) funnels its work through this loop as a [`Job`].
//! The loop runs on the thread that owns the `Context` and is the only
//! place engine code executes.
//!
//! Two counters distinguish "a job is about to land" from "a job might
//! land eventually": `enqueue` counts outstanding [`EnqueueHandle`]s,
//! `pending` counts long-lived async sources (armed timers). `listeners`
//! is a sub-class of pending used for open HTTP listeners, kept separate
//! so the executor can tell a server script apart from one that merely
//! set a timer.

use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{CoreError, JoinedErrors, Result};
use crate::vm::manager::Vm;

/// A deferred unit of engine-bound work. Created on any thread, executed
/// exactly once on the loop thread with exclusive access to the VM.
pub type Job = Box<dyn FnOnce(&mut Vm) -> Result<()> + Send + 'static>;

/// A job registered to run once after the loop goes quiet, regardless of
/// success or failure. Used to release timers and listener resources.
pub type CleanupJob = Box<dyn FnOnce(&mut Vm) + Send + 'static>;

struct LoopState {
    queue: Vec<Job>,
    cleanup: Vec<CleanupJob>,
    enqueue: usize,
    pending: usize,
    listeners: usize,
    stopped: bool,
}

pub struct EventLoop {
    state: Mutex<LoopState>,
    cond: Condvar,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                queue: Vec::new(),
                cleanup: Vec::new(),
                enqueue: 0,
                pending: 0,
                listeners: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Seed the queue with `initial` and drain jobs until quiescence.
    ///
    /// Quiescence: the queue is empty, no enqueue promise is outstanding
    /// and no pending source remains. Errors from every job are collected
    /// into a joined error rather than aborting at the first failure. The
    /// cleanup queue runs exactly once before returning. Every iteration
    /// either processes work or blocks on the condition variable.
    pub fn run(&self, vm: &mut Vm, initial: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.queue.push(initial);
        }

        let mut errors = JoinedErrors(Vec::new());
        loop {
            let mut state = self.state.lock();

            if !state.queue.is_empty() {
                let queue = mem::take(&mut state.queue);
                drop(state);
                for job in queue {
                    if let Err(err) = job(vm) {
                        errors.push(err);
                    }
                }
                continue;
            }

            if state.stopped {
                break;
            }

            if state.enqueue > 0 || state.pending > 0 || state.listeners > 0 {
                self.cond.wait(&mut state);
                continue;
            }

            break;
        }

        let cleanup = mem::take(&mut self.state.lock().cleanup);
        for job in cleanup {
            job(vm);
        }

        errors.into_result()
    }

    /// Reserve a slot in the queue. The returned handle must be used to
    /// submit exactly one job; the loop will not terminate while the
    /// handle is outstanding.
    pub fn enqueue_job(self: &Arc<Self>) -> EnqueueHandle {
        self.state.lock().enqueue += 1;
        EnqueueHandle {
            event_loop: Arc::clone(self),
            armed: true,
        }
    }

    /// Force-quiesce the loop: discard queued jobs in favor of a single
    /// job returning `err`, invalidate outstanding enqueue handles, and
    /// wake the loop. The job currently executing (if any) finishes; no
    /// further queued work runs.
    pub fn stop(&self, err: CoreError) {
        let mut state = self.state.lock();
        state.queue.clear();
        state.queue.push(Box::new(move |_vm| Err(err)));
        state.enqueue = 0;
        state.stopped = true;
        self.cond.notify_one();
    }

    /// Register a long-lived async source (an armed timer).
    pub fn add_pending(&self) {
        let mut state = self.state.lock();
        state.pending += 1;
        tracing::trace!(pending = state.pending, "added pending source");
    }

    /// Release a long-lived async source. Signals the loop, since this
    /// can be the transition that unblocks termination.
    pub fn remove_pending(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        tracing::trace!(pending = state.pending, "removed pending source");
        self.cond.notify_one();
    }

    /// Register an open listener (an HTTP server). Listeners keep the
    /// loop alive like pending sources but are tracked separately so the
    /// executor can detect server scripts from loop state.
    pub fn add_listener(&self) {
        self.state.lock().listeners += 1;
    }

    pub fn remove_listener(&self) {
        let mut state = self.state.lock();
        state.listeners = state.listeners.saturating_sub(1);
        self.cond.notify_one();
    }

    /// True while at least one listener slot is held.
    pub fn has_listeners(&self) -> bool {
        self.state.lock().listeners > 0
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Register a job to run once after quiescence.
    pub fn cleanup(&self, job: CleanupJob) {
        self.state.lock().cleanup.push(job);
    }
}

/// Single-use permission to append one job to the loop.
///
/// Submitting consumes the handle, so the double-call hazard of the
/// callback-based design cannot arise. Dropping an unsubmitted handle
/// releases the reservation so the loop cannot wedge on a producer that
/// gave up.
pub struct EnqueueHandle {
    event_loop: Arc<EventLoop>,
    armed: bool,
}

impl EnqueueHandle {
    /// Append `job` to the queue and wake the loop. A no-op if the loop
    /// has been stopped since the handle was obtained.
    pub fn submit(mut self, job: Job) {
        self.armed = false;
        let mut state = self.event_loop.state.lock();
        if state.stopped || state.enqueue == 0 {
            return;
        }
        state.queue.push(job);
        state.enqueue -= 1;
        self.event_loop.cond.notify_one();
    }

    /// The loop this handle feeds.
    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for EnqueueHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.event_loop.state.lock();
        if state.enqueue > 0 {
            state.enqueue -= 1;
            self.event_loop.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::manager::test_support::test_vm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn run_executes_initial_job_and_returns() {
        let (mut vm, el) = test_vm();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        el.run(
            &mut vm,
            Box::new(move |_vm| {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn run_waits_for_outstanding_enqueue_handle() {
        let (mut vm, el) = test_vm();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handle = el.enqueue_job();
        let order_bg = Arc::clone(&order);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.submit(Box::new(move |_vm| {
                order_bg.lock().push("late");
                Ok(())
            }));
        });

        let order_init = Arc::clone(&order);
        el.run(
            &mut vm,
            Box::new(move |_vm| {
                order_init.lock().push("initial");
                Ok(())
            }),
        )
        .unwrap();
        producer.join().unwrap();

        assert_eq!(*order.lock(), vec!["initial", "late"]);
    }

    #[test]
    fn run_aggregates_errors_from_multiple_jobs() {
        let (mut vm, el) = test_vm();
        let el2 = Arc::clone(&el);
        let err = el
            .run(
                &mut vm,
                Box::new(move |_vm| {
                    el2.enqueue_job()
                        .submit(Box::new(|_vm| Err(CoreError::Script("second".into()))));
                    Err(CoreError::Script("first".into()))
                }),
            )
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("first"), "missing first error: {rendered}");
        assert!(rendered.contains("second"), "missing second error: {rendered}");
    }

    #[test]
    fn stop_discards_queued_jobs_and_reports_error() {
        let (mut vm, el) = test_vm();
        let el_bg = Arc::clone(&el);

        // Keep the loop alive, then stop it from another thread.
        el.add_pending();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            el_bg.stop(CoreError::Canceled("deadline".into()));
        });

        let err = el
            .run(&mut vm, Box::new(|_vm| Ok(())))
            .unwrap_err();
        stopper.join().unwrap();
        assert!(matches!(err, CoreError::Canceled(_)), "got {err:?}");
    }

    #[test]
    fn submit_after_stop_is_a_noop() {
        let (mut vm, el) = test_vm();
        let handle = el.enqueue_job();
        el.stop(CoreError::Canceled("stopped".into()));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        handle.submit(Box::new(move |_vm| {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        let _ = el.run(&mut vm, Box::new(|_vm| Ok(())));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_unsubmitted_handle_unblocks_loop() {
        let (mut vm, el) = test_vm();
        let handle = el.enqueue_job();
        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(handle);
        });
        el.run(&mut vm, Box::new(|_vm| Ok(()))).unwrap();
        dropper.join().unwrap();
    }

    #[test]
    fn cleanup_runs_once_after_quiescence() {
        let (mut vm, el) = test_vm();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        el.cleanup(Box::new(move |_vm| {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        el.run(&mut vm, Box::new(|_vm| Ok(()))).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_pending_unblocks_waiting_loop() {
        let (mut vm, el) = test_vm();
        el.add_pending();
        let el_bg = Arc::clone(&el);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            el_bg.remove_pending();
        });
        el.run(&mut vm, Box::new(|_vm| Ok(()))).unwrap();
        releaser.join().unwrap();
    }

    #[test]
    fn listener_accounting_is_visible_and_keeps_loop_alive() {
        let (mut vm, el) = test_vm();
        el.add_listener();
        assert!(el.has_listeners());
        let el_bg = Arc::clone(&el);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            el_bg.remove_listener();
        });
        el.run(&mut vm, Box::new(|_vm| Ok(()))).unwrap();
        releaser.join().unwrap();
        assert!(!el.has_listeners());
    }
}
