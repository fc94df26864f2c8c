//! `console` binding.
//!
//! Output is captured per execution rather than written to the host's
//! stdout, so callers can return a script's diagnostics alongside its
//! result. The sink is shared with HTTP connection tasks, hence the
//! `Arc<Mutex<..>>` rather than loop-thread-only state.

use std::sync::Arc;

use boa_engine::{
    js_string, object::FunctionObjectBuilder, Context, JsObject, JsValue, NativeFunction,
};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::vm::manager::VmShared;

/// Accumulated console output for one execution.
#[derive(Clone, Default)]
pub struct ConsoleSink(Arc<Mutex<String>>);

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.0.lock();
        buf.push_str(line);
        buf.push('\n');
    }

    /// Copy of everything written so far.
    pub fn snapshot(&self) -> String {
        self.0.lock().clone()
    }

    /// Drain the buffer, returning its contents.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Trace, Finalize)]
struct ConsoleCaptures {
    #[unsafe_ignore_trace]
    sink: ConsoleSink,
    #[unsafe_ignore_trace]
    level: &'static str,
}

pub(crate) fn install(ctx: &mut Context, shared: &VmShared) -> Result<()> {
    let console = JsObject::with_object_proto(ctx.intrinsics());

    for level in ["log", "error", "warn", "info", "debug"] {
        let func = FunctionObjectBuilder::new(
            ctx.realm(),
            NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &ConsoleCaptures, ctx| {
                    let line = args
                        .iter()
                        .map(|v| super::display_value(v, ctx))
                        .collect::<Vec<_>>()
                        .join(" ");
                    tracing::debug!(level = captures.level, "console: {line}");
                    captures.sink.push_line(&line);
                    Ok(JsValue::undefined())
                },
                ConsoleCaptures {
                    sink: shared.console.clone(),
                    level,
                },
            ),
        )
        .name(boa_engine::JsString::from(level))
        .build();
        console
            .set(boa_engine::JsString::from(level), func, false, ctx)
            .map_err(|e| CoreError::Setup {
                module: "console".into(),
                message: e.to_string(),
            })?;
    }

    ctx.global_object()
        .set(js_string!("console"), console, false, ctx)
        .map_err(|e| CoreError::Setup {
            module: "console".into(),
            message: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::vm::manager::test_support::test_vm;

    #[test]
    fn log_lines_accumulate_in_order() {
        let (mut vm, _el) = test_vm();
        vm.eval("console.log('first', 1); console.error('second')")
            .unwrap();
        let out = vm.shared().console.snapshot();
        assert_eq!(out, "first 1\nsecond\n");
    }

    #[test]
    fn take_drains_the_buffer() {
        let (mut vm, _el) = test_vm();
        vm.eval("console.log('once')").unwrap();
        assert_eq!(vm.shared().console.take(), "once\n");
        assert_eq!(vm.shared().console.snapshot(), "");
    }
}
