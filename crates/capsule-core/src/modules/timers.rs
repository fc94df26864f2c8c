//! `setTimeout` / `setInterval` and friends.
//!
//! Each armed timer is a tokio task racing a sleep (or ticker) against a
//! cancellation signal. Firing never touches the engine from the task:
//! the task submits a job carrying only the timer id, and the job looks
//! the callback up in the per-VM registry on the loop thread.
//!
//! A timer holds one `pending` slot on the event loop for its whole
//! lifetime and an enqueue reservation for its next submission, so the
//! loop cannot quiesce while a callback might still land.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boa_engine::{
    object::FunctionObjectBuilder, Context, JsArgs, JsObject, JsValue, NativeFunction,
};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::error::{CoreError, Result};
use crate::modules::type_error;
use crate::vm::event_loop::EventLoop;
use crate::vm::manager::{SharedCaptures, Vm, VmShared};
use crate::vm::module::Module;

/// Shared between the registry and the timer's task. `stopped` makes
/// cancellation idempotent: the first stop wins, later stops (and a fire
/// racing a stop) observe the flag and do nothing.
struct TimerState {
    stopped: AtomicBool,
    cancel: Notify,
    pending_released: AtomicBool,
}

impl TimerState {
    /// Give back the timer's pending slot. Exactly one of the firing
    /// job, the task's cancel arm, and an explicit stop does this; a
    /// one-shot cleared after its task already committed to firing
    /// must not leave the slot held, or the loop never quiesces.
    fn release_pending(&self, event_loop: &EventLoop) {
        if !self.pending_released.swap(true, Ordering::SeqCst) {
            event_loop.remove_pending();
        }
    }
}

struct TimerEntry {
    callback: JsObject,
    args: Vec<JsValue>,
    repeat: bool,
    state: Arc<TimerState>,
}

/// Per-VM table of live timers, keyed by the id handed back to scripts.
#[derive(Default)]
pub struct TimerRegistry {
    next_id: i64,
    entries: HashMap<i64, TimerEntry>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, callback: JsObject, args: Vec<JsValue>, repeat: bool) -> (i64, Arc<TimerState>) {
        self.next_id += 1;
        let id = self.next_id;
        let state = Arc::new(TimerState {
            stopped: AtomicBool::new(false),
            cancel: Notify::new(),
            pending_released: AtomicBool::new(false),
        });
        self.entries.insert(
            id,
            TimerEntry {
                callback,
                args,
                repeat,
                state: Arc::clone(&state),
            },
        );
        (id, state)
    }

    /// Cancel a timer. Unknown ids (including already-fired one-shots and
    /// repeated cancellations) are ignored.
    pub fn stop(&mut self, id: i64, event_loop: &EventLoop) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        entry.state.release_pending(event_loop);
        if !entry.state.stopped.swap(true, Ordering::SeqCst) {
            entry.state.cancel.notify_one();
        }
        true
    }

    pub fn stop_all(&mut self, event_loop: &EventLoop) {
        let ids: Vec<i64> = self.entries.keys().copied().collect();
        for id in ids {
            self.stop(id, event_loop);
        }
    }

    fn snapshot(&self, id: i64) -> Option<(JsObject, Vec<JsValue>, bool, Arc<TimerState>)> {
        self.entries.get(&id).map(|e| {
            (
                e.callback.clone(),
                e.args.clone(),
                e.repeat,
                Arc::clone(&e.state),
            )
        })
    }

    fn remove(&mut self, id: i64) {
        self.entries.remove(&id);
    }
}

/// Delays outside `[1, 2^31 - 1]` milliseconds (including NaN from a
/// missing argument) collapse to 1ms.
fn clamp_delay(ms: f64) -> u64 {
    if !ms.is_finite() || ms < 1.0 || ms > 2_147_483_647.0 {
        return 1;
    }
    ms as u64
}

fn schedule(
    ctx: &mut Context,
    shared: &VmShared,
    args: &[JsValue],
    repeat: bool,
) -> boa_engine::JsResult<JsValue> {
    let Some(callback) = args.get_or_undefined(0).as_object().filter(|o| o.is_callable())
    else {
        return Err(type_error("callback must be a function"));
    };
    let delay = clamp_delay(args.get_or_undefined(1).to_number(ctx)?);
    let extra: Vec<JsValue> = args.iter().skip(2).cloned().collect();

    let (id, state) = shared
        .timers
        .borrow_mut()
        .insert(callback.clone(), extra, repeat);

    let event_loop = Arc::clone(&shared.event_loop);
    event_loop.add_pending();
    let handle = event_loop.enqueue_job();
    event_loop.cleanup(Box::new(move |vm: &mut Vm| {
        let event_loop = Arc::clone(&vm.shared().event_loop);
        vm.shared().timers.borrow_mut().stop(id, &event_loop);
    }));

    let duration = Duration::from_millis(delay);
    if repeat {
        shared.rt.spawn(run_interval(event_loop, state, duration, id, handle));
    } else {
        shared.rt.spawn(run_timeout(event_loop, state, duration, id, handle));
    }

    Ok(JsValue::from(id as f64))
}

async fn run_timeout(
    event_loop: Arc<EventLoop>,
    state: Arc<TimerState>,
    delay: Duration,
    id: i64,
    handle: crate::vm::event_loop::EnqueueHandle,
) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {
            handle.submit(Box::new(move |vm| fire(vm, id)));
        }
        _ = state.cancel.notified() => {
            state.release_pending(&event_loop);
            handle.submit(Box::new(|_vm| Ok(())));
        }
    }
}

async fn run_interval(
    event_loop: Arc<EventLoop>,
    state: Arc<TimerState>,
    period: Duration,
    id: i64,
    mut handle: crate::vm::event_loop::EnqueueHandle,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handle.submit(Box::new(move |vm| fire(vm, id)));
                handle = event_loop.enqueue_job();
            }
            _ = state.cancel.notified() => {
                state.release_pending(&event_loop);
                handle.submit(Box::new(|_vm| Ok(())));
                return;
            }
        }
    }
}

/// Runs on the loop thread when a timer's deadline lands. A timer that
/// was cancelled after its task committed to firing is found stopped (or
/// gone) here and skipped.
fn fire(vm: &mut Vm, id: i64) -> Result<()> {
    let snapshot = vm.shared().timers.borrow().snapshot(id);
    let Some((callback, args, repeat, state)) = snapshot else {
        return Ok(());
    };
    if state.stopped.load(Ordering::SeqCst) {
        if !repeat {
            state.release_pending(&vm.shared().event_loop);
        }
        return Ok(());
    }
    if !repeat {
        state.stopped.store(true, Ordering::SeqCst);
        vm.shared().timers.borrow_mut().remove(id);
        state.release_pending(&vm.shared().event_loop);
    }
    vm.call_function(&callback, &args).map(|_| ())
}

fn clear(ctx: &mut Context, shared: &VmShared, args: &[JsValue]) -> boa_engine::JsResult<JsValue> {
    let id = args.get_or_undefined(0).to_number(ctx)? as i64;
    shared.timers.borrow_mut().stop(id, &shared.event_loop);
    Ok(JsValue::undefined())
}

pub struct TimersModule;

impl Module for TimersModule {
    fn name(&self) -> &'static str {
        "timers"
    }

    fn setup(&self, ctx: &mut Context, shared: &VmShared) -> Result<()> {
        let bindings: [(&str, fn(&mut Context, &VmShared, &[JsValue]) -> boa_engine::JsResult<JsValue>); 4] = [
            ("setTimeout", |ctx, shared, args| schedule(ctx, shared, args, false)),
            ("setInterval", |ctx, shared, args| schedule(ctx, shared, args, true)),
            ("clearTimeout", clear),
            ("clearInterval", clear),
        ];

        for (name, entry) in bindings {
            let func = FunctionObjectBuilder::new(
                ctx.realm(),
                NativeFunction::from_copy_closure_with_captures(
                    move |_this, args, captures: &SharedCaptures, ctx| {
                        entry(ctx, &captures.shared, args)
                    },
                    SharedCaptures {
                        shared: shared.clone(),
                    },
                ),
            )
            .name(boa_engine::JsString::from(name))
            .length(1)
            .build();
            ctx.global_object()
                .set(boa_engine::JsString::from(name), func, false, ctx)
                .map_err(|e| CoreError::Setup {
                    module: "timers".into(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;
    use serde_json::json;

    fn run(source: &str) -> Option<serde_json::Value> {
        let (mut vm, _el) = test_vm();
        let (tx, rx) = std::sync::mpsc::channel();
        vm.run_source(
            source.into(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )
        .unwrap();
        // Loop has quiesced; read final state out of the VM.
        let _ = rx.recv().unwrap();
        vm.eval_to_json("globalThis.__out").unwrap()
    }

    #[test]
    fn timeout_fires_after_delay() {
        let out = run("globalThis.__out = 0; setTimeout(() => { globalThis.__out = 1; }, 10);");
        assert_eq!(out, Some(json!(1.0)));
    }

    #[test]
    fn cleared_timeout_never_fires() {
        let out = run(
            "globalThis.__out = 0;\n\
             const id = setTimeout(() => { globalThis.__out = 1; }, 10);\n\
             clearTimeout(id);",
        );
        assert_eq!(out, Some(json!(0.0)));
    }

    #[test]
    fn clearing_twice_is_harmless() {
        let out = run(
            "globalThis.__out = 0;\n\
             const id = setTimeout(() => { globalThis.__out = 1; }, 10);\n\
             clearTimeout(id);\n\
             clearTimeout(id);\n\
             clearTimeout(9999);",
        );
        assert_eq!(out, Some(json!(0.0)));
    }

    #[test]
    fn clearing_after_a_busy_wait_still_quiesces() {
        // The 1ms deadline elapses while the script is still running,
        // so the timer task commits to firing before clearTimeout runs.
        let out = run(
            "globalThis.__out = 0;\n\
             const id = setTimeout(() => { globalThis.__out = 1; }, 1);\n\
             const start = Date.now();\n\
             while (Date.now() - start < 200) {}\n\
             clearTimeout(id);",
        );
        assert_eq!(out, Some(json!(0.0)));
    }

    #[test]
    fn interval_repeats_until_cleared() {
        let out = run(
            "globalThis.__out = 0;\n\
             const id = setInterval(() => {\n\
               globalThis.__out += 1;\n\
               if (globalThis.__out >= 3) clearInterval(id);\n\
             }, 5);",
        );
        assert_eq!(out, Some(json!(3.0)));
    }

    #[test]
    fn timers_fire_in_delay_order_not_creation_order() {
        let out = run(
            "globalThis.__out = [];\n\
             setTimeout(() => { globalThis.__out.push('slow'); }, 60);\n\
             setTimeout(() => { globalThis.__out.push('fast'); }, 5);",
        );
        assert_eq!(out, Some(json!(["fast", "slow"])));
    }

    #[test]
    fn extra_arguments_reach_the_callback() {
        let out = run(
            "globalThis.__out = null;\n\
             setTimeout((a, b) => { globalThis.__out = a + b; }, 5, 'x', 'y');",
        );
        assert_eq!(out, Some(json!("xy")));
    }

    #[test]
    fn non_function_callback_is_a_type_error() {
        let (mut vm, _el) = test_vm();
        let err = vm.eval("setTimeout(42, 10)").unwrap_err();
        assert!(err.to_string().contains("callback must be a function"));
    }

    #[test]
    fn delay_clamping() {
        assert_eq!(super::clamp_delay(f64::NAN), 1);
        assert_eq!(super::clamp_delay(-5.0), 1);
        assert_eq!(super::clamp_delay(0.0), 1);
        assert_eq!(super::clamp_delay(250.0), 250);
        assert_eq!(super::clamp_delay(3_000_000_000.0), 1);
    }
}
