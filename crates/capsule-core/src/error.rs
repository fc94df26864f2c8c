use std::fmt;

use thiserror::Error;

/// Errors produced by the capsule core.
///
/// Engine errors (`boa_engine::JsError`) are not `Send`, so they are
/// converted to owned strings at the host/engine boundary and carried in
/// the `Script` variant. The event loop aggregates every failed job into
/// a `Join` instead of dropping all but the first.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("module setup failed: {module}: {message}")]
    Setup { module: &'static str, message: String },

    #[error("script error: {0}")]
    Script(String),

    #[error("execution timed out after {0}ms")]
    Timeout(u64),

    #[error("execution canceled: {0}")]
    Canceled(String),

    #[error("module error: {0}")]
    Module(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Join(JoinedErrors),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Multiple job errors collected by one event-loop run, rendered
/// semicolon-separated so none of them is silently dropped.
#[derive(Debug)]
pub struct JoinedErrors(pub Vec<CoreError>);

impl JoinedErrors {
    /// Collapse a batch of errors into a single `CoreError`, or `Ok` when
    /// the batch is empty. A single error is returned as itself.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(CoreError::Join(self)),
        }
    }

    pub fn push(&mut self, err: CoreError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl CoreError {
    /// Convert an engine error into an owned, `Send` script error.
    pub fn from_js(err: &boa_engine::JsError) -> Self {
        CoreError::Script(err.to_string())
    }

    /// True when this error (or any member of a join) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            CoreError::Timeout(_) => true,
            CoreError::Join(join) => join.0.iter().any(CoreError::is_timeout),
            _ => false,
        }
    }
}
