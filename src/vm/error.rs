use std::io;

use crate::vm::engine::EngineError;
use crate::vm::machine::VmState;

/// Errors returned by [`Vm`](crate::vm::Vm) operations.
///
/// Every variant that comes from a build step carries the step path, e.g.
/// `attach disks: create root disk: permission denied`.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// A host resource is missing or a device could not be built.
    #[error("{step}: {message}")]
    Configuration { step: String, message: String },

    /// Reading or writing the data bundle failed.
    #[error("{step}: {source}")]
    StateIo {
        step: String,
        #[source]
        source: io::Error,
    },

    /// The engine failed to build, start or stop the machine.
    #[error("{step}: {source}")]
    Engine {
        step: String,
        #[source]
        source: EngineError,
    },

    /// The engine looked at the assembled configuration and rejected it.
    /// Retrying with the same inputs will fail the same way.
    #[error("invalid configuration")]
    InvalidConfiguration,

    /// The caller's cancellation fired before the guest finished stopping.
    #[error("stop cancelled before the virtual machine shut down")]
    Cancelled,

    #[error("cannot start a virtual machine that is {0:?}")]
    InvalidState(VmState),
}

impl VmError {
    pub fn configuration(step: impl Into<String>, message: impl ToString) -> Self {
        Self::Configuration {
            step: step.into(),
            message: message.to_string(),
        }
    }

    pub fn state_io(step: impl Into<String>, source: io::Error) -> Self {
        Self::StateIo {
            step: step.into(),
            source,
        }
    }

    pub fn engine(step: impl Into<String>, source: EngineError) -> Self {
        Self::Engine {
            step: step.into(),
            source,
        }
    }

    /// Prefix the step path with an outer step.
    pub fn within(self, outer: &str) -> Self {
        match self {
            Self::Configuration { step, message } => Self::Configuration {
                step: format!("{outer}: {step}"),
                message,
            },
            Self::StateIo { step, source } => Self::StateIo {
                step: format!("{outer}: {step}"),
                source,
            },
            Self::Engine { step, source } => Self::Engine {
                step: format!("{outer}: {step}"),
                source,
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidConfiguration | Self::InvalidState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_steps_read_outer_to_inner() {
        let err = VmError::state_io("create root disk", io::Error::other("disk full")).within("attach disks");
        assert_eq!(err.to_string(), "attach disks: create root disk: disk full");
    }

    #[test]
    fn cancellation_is_distinct_from_engine_failure() {
        assert!(VmError::Cancelled.is_cancelled());
        assert!(!VmError::engine("stop", EngineError::new("boom")).is_cancelled());
    }
}
