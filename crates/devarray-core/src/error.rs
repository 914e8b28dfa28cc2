//! Error taxonomy for device arrays.
//!
//! Precondition failures are raised from array state alone, before any
//! driver call. Driver failures carry the array name together with the raw
//! status code and the driver's own description of it.

use std::fmt;

/// A failed driver call: raw status code plus the driver's description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{description} ({code})")]
pub struct DriverError {
    pub code: i32,
    pub description: String,
}

impl DriverError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Which transfer a [`ArrayError::Transfer`] was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOp {
    Upload,
    Download,
    /// Device-to-device copy into the named destination.
    Copy { destination: String },
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOp::Upload => write!(f, "uploading"),
            TransferOp::Download => write!(f, "downloading"),
            TransferOp::Copy { destination } => write!(f, "copying to '{destination}'"),
        }
    }
}

/// Coarse classification of [`ArrayError`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AlreadyInitialized,
    NotInitialized,
    BorrowedArray,
    Range,
    IncompatibleArray,
    ElementSizeMismatch,
    Allocation,
    Deallocation,
    Transfer,
    ContextActivation,
    BackendMismatch,
    ContextMismatch,
}

/// Device array errors.
#[derive(Debug, thiserror::Error)]
pub enum ArrayError {
    #[error("array '{name}' has already been initialized")]
    AlreadyInitialized { name: String },

    #[error("array '{name}' has not been initialized")]
    NotInitialized { name: String },

    #[error("cannot resize array '{name}': it does not own its storage")]
    BorrowedArray { name: String },

    #[error("array '{name}': elements {offset}..{offset}+{count} exceed the array size {size}")]
    Range {
        name: String,
        offset: usize,
        count: usize,
        size: usize,
    },

    #[error("array '{name}': {size} elements of {element_size} bytes overflow the address space")]
    TooLarge {
        name: String,
        size: usize,
        element_size: usize,
    },

    #[error("array '{name}': host buffer holds {actual} bytes, {needed} required")]
    HostBufferTooSmall {
        name: String,
        needed: usize,
        actual: usize,
    },

    #[error(
        "error copying array '{src}' to '{dst}': destination holds {dst_size} x {dst_element_size} bytes, \
         source holds {src_size} x {src_element_size} bytes"
    )]
    IncompatibleArray {
        src: String,
        dst: String,
        src_size: usize,
        src_element_size: usize,
        dst_size: usize,
        dst_element_size: usize,
    },

    #[error("array '{name}': {actual} host elements do not match the array size {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("array '{name}' holds {expected}-byte elements, host type has {actual} bytes")]
    ElementSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("error creating array '{name}': {error}")]
    Allocation {
        name: String,
        #[source]
        error: DriverError,
    },

    #[error("error creating array '{name}': driver returned a null pointer for {bytes} bytes")]
    NullAllocation { name: String, bytes: usize },

    #[error("error deleting array '{name}': {error}")]
    Deallocation {
        name: String,
        #[source]
        error: DriverError,
    },

    #[error("error {operation} array '{name}': {error}")]
    Transfer {
        name: String,
        operation: TransferOp,
        #[source]
        error: DriverError,
    },

    #[error("failed to make {backend} context current: {error}")]
    ContextActivation {
        backend: &'static str,
        #[source]
        error: DriverError,
    },

    #[error("backend mismatch: expected a {expected} {what}, found {found}")]
    BackendMismatch {
        expected: &'static str,
        found: &'static str,
        what: &'static str,
    },

    #[error("error copying array '{src}' to '{dst}': the arrays belong to different contexts")]
    ContextMismatch { src: String, dst: String },
}

impl ArrayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArrayError::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
            ArrayError::NotInitialized { .. } => ErrorKind::NotInitialized,
            ArrayError::BorrowedArray { .. } => ErrorKind::BorrowedArray,
            ArrayError::Range { .. }
            | ArrayError::TooLarge { .. }
            | ArrayError::HostBufferTooSmall { .. } => ErrorKind::Range,
            ArrayError::IncompatibleArray { .. } | ArrayError::LengthMismatch { .. } => {
                ErrorKind::IncompatibleArray
            }
            ArrayError::ElementSizeMismatch { .. } => ErrorKind::ElementSizeMismatch,
            ArrayError::Allocation { .. } | ArrayError::NullAllocation { .. } => {
                ErrorKind::Allocation
            }
            ArrayError::Deallocation { .. } => ErrorKind::Deallocation,
            ArrayError::Transfer { .. } => ErrorKind::Transfer,
            ArrayError::ContextActivation { .. } => ErrorKind::ContextActivation,
            ArrayError::BackendMismatch { .. } => ErrorKind::BackendMismatch,
            ArrayError::ContextMismatch { .. } => ErrorKind::ContextMismatch,
        }
    }

    /// The underlying driver failure, for the variants that wrap one.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            ArrayError::Allocation { error, .. }
            | ArrayError::Deallocation { error, .. }
            | ArrayError::Transfer { error, .. }
            | ArrayError::ContextActivation { error, .. } => Some(error),
            _ => None,
        }
    }
}
