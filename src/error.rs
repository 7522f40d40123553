use thiserror::Error;

#[derive(Error, Debug)]
pub enum HbmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Not supported: {0}")]
    NoSupport(String),

    #[error("Backend Error: {0}")]
    Backend(String),

    #[error("Cannot {op} a BO in the {state} state")]
    InvalidState { op: &'static str, state: &'static str },

    #[error("The device of this BO has been destroyed")]
    DeviceLost,
}

/// Coarse classification of an [`HbmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed invalid or mismatched inputs.
    Contract,
    /// The device or memory type cannot satisfy the request.
    Capability,
    /// The allocator, kernel, or device failed.
    Backend,
    /// The BO is in the wrong state for the operation.
    State,
}

impl HbmError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParam(_) | Self::DeviceLost => ErrorKind::Contract,
            Self::NoSupport(_) => ErrorKind::Capability,
            Self::Io(_) | Self::Backend(_) => ErrorKind::Backend,
            Self::InvalidState { .. } => ErrorKind::State,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    pub(crate) fn unsupported(msg: impl Into<String>) -> Self {
        Self::NoSupport(msg.into())
    }
}

// A convenient alias
pub type HbmResult<T> = Result<T, HbmError>;
