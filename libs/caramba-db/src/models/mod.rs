pub mod assignment;
pub mod groups;
pub mod monitoring;
pub mod node;

use thiserror::Error;

/// A text column held a value outside its enum.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
