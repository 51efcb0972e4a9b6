use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such container: {0}")]
    NotFound(String),
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("{op} timed out after {}ms", after.as_millis())]
    Timeout { op: String, after: Duration },
    #[error("{op} failed (exit {code:?}): {stderr}")]
    Command {
        op: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("invalid isolation key: {0:?}")]
    InvalidKey(String),
    #[error("unexpected runtime output: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_) | RuntimeError::Timeout { .. })
    }
}
