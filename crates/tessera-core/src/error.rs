use crate::device::Device;
use crate::shape::Shape;

/// All errors that can occur within Tessera.
///
/// Validation errors (shape, rank, device) are raised by the binding layer
/// before anything reaches the engine. Execution errors are recorded on the
/// failed operation and handed to every waiter, which is why the type is
/// `Clone`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two arrays (e.g., trying to add [2,3] + [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Dimension index out of range for the array's rank.
    #[error("dimension out of range: dim {dim} for array with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Operation requires a specific rank (number of dimensions).
    #[error("rank mismatch: expected rank {expected}, got {got}")]
    RankMismatch { expected: usize, got: usize },

    /// Element count mismatch when creating from a vec.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("dot shape mismatch: [{m}x{k1}] @ [{k2}x{n}], inner dims must match")]
    DotShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// Two operands live on different devices.
    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    /// The engine has no execution lanes for this device.
    #[error("device {0} is not available on this engine")]
    DeviceNotFound(Device),

    /// Two operands were created by different engine instances.
    #[error("operands belong to different engines")]
    EngineMismatch,

    /// Work was submitted after the engine was shut down.
    #[error("engine has been shut down")]
    EngineShutdown,

    /// A dispatched kernel reported failure (or panicked).
    #[error("kernel '{op}' failed: {message}")]
    KernelExecution { op: String, message: String },

    /// An operation was skipped because one of its inputs came from a failed
    /// operation. `origin` names the kernel that failed first.
    #[error("operation '{op}' skipped: upstream kernel '{origin}' failed: {message}")]
    DependencyPropagated {
        op: String,
        origin: String,
        message: String,
    },

    /// Reading or writing a checkpoint failed.
    #[error("io error: {0}")]
    Io(String),

    /// Invalid engine configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Wrap this error as the failure of kernel `op`.
    ///
    /// Errors that already describe an execution failure are kept as-is so
    /// the original kernel name survives.
    pub fn into_kernel_error(self, op: &str) -> Self {
        match self {
            e @ (Error::KernelExecution { .. } | Error::DependencyPropagated { .. }) => e,
            other => Error::KernelExecution {
                op: op.to_string(),
                message: other.to_string(),
            },
        }
    }

    /// The error a successor named `op` inherits from this failure.
    pub fn propagate_to(&self, op: &str) -> Self {
        let (origin, message) = match self {
            Error::KernelExecution { op, message } => (op.clone(), message.clone()),
            Error::DependencyPropagated {
                origin, message, ..
            } => (origin.clone(), message.clone()),
            other => ("<unknown>".to_string(), other.to_string()),
        };
        Error::DependencyPropagated {
            op: op.to_string(),
            origin,
            message,
        }
    }

    /// Whether this error was produced while executing (rather than
    /// validating) an operation.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Error::KernelExecution { .. } | Error::DependencyPropagated { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Convenience Result type used throughout Tessera.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_wrapping() {
        let e = Error::msg("bad input").into_kernel_error("scale");
        assert_eq!(
            e,
            Error::KernelExecution {
                op: "scale".into(),
                message: "bad input".into()
            }
        );
        // Already an execution failure: op name is preserved
        let again = e.clone().into_kernel_error("other");
        assert_eq!(again, e);
    }

    #[test]
    fn test_propagation_keeps_origin() {
        let root = Error::KernelExecution {
            op: "fill".into(),
            message: "boom".into(),
        };
        let hop1 = root.propagate_to("add");
        let hop2 = hop1.propagate_to("relu");
        match hop2 {
            Error::DependencyPropagated {
                op,
                origin,
                message,
            } => {
                assert_eq!(op, "relu");
                assert_eq!(origin, "fill");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
