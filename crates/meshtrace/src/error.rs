use std::fmt;

use thiserror::Error;

use crate::pipeline::PipelineStage;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of [`Error`], for callers that branch on the kind of
/// failure rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    Initialization,
    Compilation,
    DeviceMemory,
    Execution,
    UnknownAccel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    Alloc,
    Free,
    CopyToDevice,
    CopyFromDevice,
}

impl fmt::Display for MemoryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemoryOp::Alloc => "alloc",
            MemoryOp::Free => "free",
            MemoryOp::CopyToDevice => "copy to device",
            MemoryOp::CopyFromDevice => "copy from device",
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Rejected before any device work was issued.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Subsystem or device context creation failed. The context refuses all
    /// further work afterwards.
    #[error("{stage} failed: {message}")]
    Initialization { stage: &'static str, message: String },

    /// Module, program group or pipeline creation failed; `log` is the full
    /// diagnostic output of the compiler.
    #[error("{stage} failed: {log}")]
    Compilation { stage: PipelineStage, log: String },

    #[error("device memory {operation} failed: {message}")]
    DeviceMemory { operation: MemoryOp, message: String },

    #[error("{operation} failed: {message}")]
    Execution { operation: &'static str, message: String },

    #[error("acceleration structure {handle:#x} is not owned by this context")]
    UnknownAccel { handle: u64 },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Initialization { .. } => ErrorKind::Initialization,
            Error::Compilation { .. } => ErrorKind::Compilation,
            Error::DeviceMemory { .. } => ErrorKind::DeviceMemory,
            Error::Execution { .. } => ErrorKind::Execution,
            Error::UnknownAccel { .. } => ErrorKind::UnknownAccel,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub fn memory(operation: MemoryOp, message: impl Into<String>) -> Self {
        Error::DeviceMemory { operation, message: message.into() }
    }

    pub fn execution(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Execution { operation, message: message.into() }
    }

    pub fn compilation(stage: PipelineStage, log: impl Into<String>) -> Self {
        Error::Compilation { stage, log: log.into() }
    }

    pub fn initialization(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Initialization { stage, message: message.into() }
    }
}
