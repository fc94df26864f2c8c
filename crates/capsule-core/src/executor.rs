//! Script execution orchestration.
//!
//! Each execution gets a fresh VM on its own OS thread (the engine is
//! not `Send`), a fresh event loop, and a deadline. The caller's async
//! task supervises from outside: it learns the top-level result the
//! moment the script settles, then either waits for loop quiescence or,
//! when the script opened a listener, detaches the VM and lets it serve.
//!
//! The engine has no preemption hook, so the deadline is enforced at job
//! boundaries: the watchdog force-stops the loop and a job already in
//! flight runs to completion first.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CoreError, Result};
use crate::modules::console::ConsoleSink;
use crate::vm::event_loop::EventLoop;
use crate::vm::manager::VmManager;
use crate::vm::module::ModulePolicy;

/// How long to wait after a forced stop for the worker to come back.
const STOP_GRACE: Duration = Duration::from_secs(1);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct ExecutorConfig {
    /// Wall-clock budget for one execution, top-level script and queued
    /// work together. Detached servers are exempt once detached.
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(CoreError::Config("timeout must be greater than zero".into()));
        }
        Ok(())
    }
}

/// The observable outcome of one execution.
#[derive(Debug)]
pub struct ExecuteOutcome {
    /// JSON form of the script's completion value, when it had one.
    pub result: Option<serde_json::Value>,
    /// Captured console output.
    pub output: String,
    pub error: Option<String>,
    pub timed_out: bool,
    /// True when the script opened a listener and its VM was left
    /// running in the background.
    pub detached: bool,
}

struct DetachedVm {
    event_loop: Arc<EventLoop>,
    thread: std::thread::JoinHandle<()>,
}

pub struct Executor {
    manager: Arc<VmManager>,
    config: ExecutorConfig,
    rt: tokio::runtime::Handle,
    detached: Mutex<Vec<DetachedVm>>,
}

impl Executor {
    pub fn new(
        manager: Arc<VmManager>,
        config: ExecutorConfig,
        rt: tokio::runtime::Handle,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            manager,
            config,
            rt,
            detached: Mutex::new(Vec::new()),
        })
    }

    /// The configured per-execution deadline.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Number of server VMs currently running in the background.
    pub fn detached_count(&self) -> usize {
        self.detached.lock().len()
    }

    /// Runs one script to completion under the configured deadline.
    ///
    /// The script executes on a dedicated worker thread with a fresh VM
    /// and event loop. The call resolves once the loop quiesces, the
    /// deadline fires, or the script opens a listener (in which case
    /// the VM is detached and kept running in the background).
    ///
    /// This never fails at the Rust level; script failures, timeouts,
    /// and worker faults are all reported through [`ExecuteOutcome`].
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let outcome = executor.execute("1 + 1".into()).await;
    /// assert_eq!(outcome.result, Some(serde_json::json!(2.0)));
    /// ```
    pub async fn execute(&self, source: String) -> ExecuteOutcome {
        self.execute_with_timeout(source, None).await
    }

    /// Like [`Executor::execute`], but with an optional per-call
    /// deadline overriding the configured one.
    pub async fn execute_with_timeout(
        &self,
        source: String,
        timeout: Option<Duration>,
    ) -> ExecuteOutcome {
        let budget = timeout.unwrap_or(self.config.timeout);
        if budget.is_zero() {
            return ExecuteOutcome {
                result: None,
                output: String::new(),
                error: Some(CoreError::Config("timeout must be greater than zero".into()).to_string()),
                timed_out: false,
                detached: false,
            };
        }
        let sink = ConsoleSink::new();
        let event_loop = Arc::new(EventLoop::new());

        let (settled_tx, settled_rx) = oneshot::channel();
        let (done_tx, mut done_rx) = oneshot::channel::<Option<CoreError>>();

        let worker = {
            let manager = Arc::clone(&self.manager);
            let event_loop = Arc::clone(&event_loop);
            let rt = self.rt.clone();
            let sink = sink.clone();
            std::thread::Builder::new()
                .name("capsule-vm".into())
                .spawn(move || {
                    let mut vm = match manager.create_vm(event_loop, rt, sink) {
                        Ok(vm) => vm,
                        Err(err) => {
                            let _ = done_tx.send(Some(err));
                            return;
                        }
                    };
                    let mut settled_tx = Some(settled_tx);
                    let loop_result = vm.run_source(
                        source,
                        Box::new(move |res| {
                            if let Some(tx) = settled_tx.take() {
                                let _ = tx.send(res);
                            }
                        }),
                    );
                    vm.close();
                    let _ = done_tx.send(loop_result.err());
                })
        };
        let worker = match worker {
            Ok(handle) => handle,
            Err(err) => {
                return ExecuteOutcome {
                    result: None,
                    output: String::new(),
                    error: Some(format!("failed to spawn worker thread: {err}")),
                    timed_out: false,
                    detached: false,
                }
            }
        };

        let deadline = tokio::time::Instant::now() + budget;

        let settled = match tokio::time::timeout_at(deadline, settled_rx).await {
            Ok(settled) => settled,
            Err(_) => {
                // Top-level script still running at the deadline.
                return self.force_stop(&event_loop, done_rx, &sink, budget).await;
            }
        };

        let script_result = match settled {
            Ok(res) => res,
            Err(_) => {
                // Worker died before the script settled; the loop error
                // carries the reason.
                let error = match done_rx.await {
                    Ok(Some(err)) => Some(err.to_string()),
                    Ok(None) => None,
                    Err(_) => Some("worker thread terminated unexpectedly".into()),
                };
                let _ = worker.join();
                return ExecuteOutcome {
                    result: None,
                    output: sink.take(),
                    error,
                    timed_out: false,
                    detached: false,
                };
            }
        };

        if event_loop.has_listeners() {
            tracing::info!("script opened a listener, detaching VM");
            self.detached.lock().push(DetachedVm {
                event_loop: Arc::clone(&event_loop),
                thread: worker,
            });
            let (result, error) = split_script_result(script_result);
            return ExecuteOutcome {
                result,
                output: sink.snapshot(),
                error,
                timed_out: false,
                detached: true,
            };
        }

        let waited = tokio::time::timeout_at(deadline, &mut done_rx).await;
        match waited {
            Ok(Ok(loop_error)) => {
                let _ = worker.join();
                let (result, script_error) = split_script_result(script_result);
                let timed_out = loop_error.as_ref().is_some_and(|e| e.is_timeout());
                ExecuteOutcome {
                    result,
                    output: sink.take(),
                    error: loop_error.map(|e| e.to_string()).or(script_error),
                    timed_out,
                    detached: false,
                }
            }
            Ok(Err(_)) => ExecuteOutcome {
                result: None,
                output: sink.take(),
                error: Some("worker thread terminated unexpectedly".into()),
                timed_out: false,
                detached: false,
            },
            Err(_) => self.force_stop(&event_loop, done_rx, &sink, budget).await,
        }
    }

    /// Deadline handling: stop the loop and give the worker a short
    /// grace period to unwind. A job stuck inside the engine cannot be
    /// interrupted; it is reported and left behind.
    async fn force_stop(
        &self,
        event_loop: &Arc<EventLoop>,
        done_rx: oneshot::Receiver<Option<CoreError>>,
        sink: &ConsoleSink,
        budget: Duration,
    ) -> ExecuteOutcome {
        let timeout_ms = budget.as_millis() as u64;
        event_loop.stop(CoreError::Timeout(timeout_ms));
        let error = match tokio::time::timeout(STOP_GRACE, done_rx).await {
            Ok(Ok(Some(err))) => err.to_string(),
            Ok(_) => CoreError::Timeout(timeout_ms).to_string(),
            Err(_) => {
                tracing::warn!("worker did not stop within grace period, abandoning it");
                CoreError::Timeout(timeout_ms).to_string()
            }
        };
        ExecuteOutcome {
            result: None,
            output: sink.snapshot(),
            error: Some(error),
            timed_out: true,
            detached: false,
        }
    }

    /// Stop every detached server VM and wait for its thread.
    pub fn shutdown(&self) {
        let detached = std::mem::take(&mut *self.detached.lock());
        for vm in detached {
            vm.event_loop
                .stop(CoreError::Canceled("host shutting down".into()));
            if vm.thread.join().is_err() {
                tracing::warn!("detached worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn split_script_result(
    res: std::result::Result<Option<serde_json::Value>, String>,
) -> (Option<serde_json::Value>, Option<String>) {
    match res {
        Ok(value) => (value, None),
        Err(message) => (None, Some(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(timeout: Duration) -> Executor {
        let manager = Arc::new(VmManager::with_default_modules(ModulePolicy::AllowAll));
        Executor::new(
            manager,
            ExecutorConfig { timeout },
            tokio::runtime::Handle::current(),
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returns_script_value_and_output() {
        let ex = executor(Duration::from_secs(5));
        let outcome = ex.execute("console.log('hi'); 6 * 7".into()).await;
        assert_eq!(outcome.result, Some(serde_json::json!(42.0)));
        assert_eq!(outcome.output, "hi\n");
        assert!(outcome.error.is_none());
        assert!(!outcome.detached);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn script_error_is_reported() {
        let ex = executor(Duration::from_secs(5));
        let outcome = ex.execute("throw new Error('nope')".into()).await;
        assert!(outcome.result.is_none());
        let error = outcome.error.unwrap();
        assert!(error.contains("nope"), "got {error}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waits_for_timers_before_returning() {
        let ex = executor(Duration::from_secs(5));
        let outcome = ex
            .execute("setTimeout(() => console.log('late'), 30); 'done'".into())
            .await;
        assert_eq!(outcome.result, Some(serde_json::json!("done")));
        assert_eq!(outcome.output, "late\n");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn long_pending_work_times_out() {
        let ex = executor(Duration::from_millis(200));
        let outcome = ex
            .execute("setTimeout(() => console.log('never'), 60000);".into())
            .await;
        assert!(outcome.timed_out);
        assert!(outcome.output.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn per_call_timeout_overrides_config() {
        let ex = executor(Duration::from_secs(60));
        let outcome = ex
            .execute_with_timeout(
                "setTimeout(() => {}, 60000);".into(),
                Some(Duration::from_millis(200)),
            )
            .await;
        assert!(outcome.timed_out);
        let error = outcome.error.unwrap();
        assert!(error.contains("200ms"), "got {error}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn zero_timeout_is_rejected() {
        let manager = Arc::new(VmManager::with_default_modules(ModulePolicy::AllowAll));
        let err = Executor::new(
            manager,
            ExecutorConfig {
                timeout: Duration::ZERO,
            },
            tokio::runtime::Handle::current(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("timeout"), "got {err}");
    }
}
