//! Error types for the sandbox crate.
//!
//! Failures before a module runs are errors; everything that happens while it
//! runs is a [`RunOutcome`](crate::RunOutcome) instead.

use std::path::PathBuf;
use thiserror::Error;

/// A module image that cannot be used. Fatal for the run, and the same bytes
/// are not retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Image exceeds the configured size limit
    #[error("module image is {size} bytes, limit is {max}")]
    TooLarge {
        /// Image size
        size: usize,
        /// Configured limit
        max: usize,
    },

    /// Missing `\0asm` header
    #[error("bad module magic")]
    BadMagic,

    /// Binary format version other than 1
    #[error("unsupported module format version {0}")]
    UnsupportedVersion(u32),

    /// Structurally invalid module
    #[error("invalid module: {0}")]
    Invalid(String),

    /// Entry point not exported
    #[error("entry point `{0}` is not exported")]
    MissingEntryPoint(String),

    /// Entry point takes arguments or returns something other than nothing or `i32`
    #[error("entry point `{name}` has signature {found}, expected () or ()i")]
    EntryPointSignature {
        /// Export name
        name: String,
        /// Signature found in the module
        found: String,
    },
}

/// The module cannot be given a sandbox. Detected before any module code runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstantiationError {
    /// Import outside the capability table
    #[error("module imports `{module}.{name}`, which is not provided")]
    UnknownImport {
        /// Import module namespace
        module: String,
        /// Import field name
        name: String,
    },

    /// Capability imported with the wrong type
    #[error("capability `{name}` imported as {found}, expected {expected}")]
    SignatureMismatch {
        /// Capability name
        name: String,
        /// Signature bound by the host
        expected: String,
        /// Signature declared by the module
        found: String,
    },

    /// Declared initial memory exceeds the budget
    #[error("module needs {requested} bytes of linear memory, budget is {budget}")]
    MemoryBudget {
        /// Initial memory declared by the module
        requested: u64,
        /// Memory budget
        budget: u64,
    },

    /// The host cannot grant the requested memory budget
    #[error("memory budget {budget} exceeds what the host can grant ({ceiling})")]
    InsufficientMemory {
        /// Requested budget
        budget: u64,
        /// Host ceiling
        ceiling: u64,
    },

    /// Stack budget other than the engine's configured stack
    #[error("stack budget {requested} differs from engine stack limit {limit}")]
    StackBudget {
        /// Requested stack budget
        requested: usize,
        /// Engine stack limit
        limit: usize,
    },

    /// More than one memory or table
    #[error("module declares {0}, at most one of each is allowed")]
    TooManyResources(String),

    /// Runtime refused to link the module
    #[error("link failed: {0}")]
    Link(String),
}

/// Failure to read the module image from storage
#[derive(Error, Debug)]
pub enum ImageSourceError {
    /// No file at the configured path
    #[error("module image {0} not found")]
    NotFound(PathBuf),

    /// File exists but could not be read
    #[error("failed to read module image {path}: {source}")]
    Read {
        /// Image path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Image larger than allowed
    #[error("module image {path} is {size} bytes, limit is {max}")]
    TooLarge {
        /// Image path
        path: PathBuf,
        /// File size
        size: u64,
        /// Configured limit
        max: usize,
    },

    /// Zero-length image
    #[error("module image is empty")]
    Empty,
}

/// Sandbox error type
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Engine could not be created
    #[error("engine creation failed: {0}")]
    Engine(String),

    /// Operation not allowed in the instance's current stage
    #[error("operation `{operation}` not allowed in stage {stage}")]
    InvalidStage {
        /// Attempted operation
        operation: &'static str,
        /// Current stage
        stage: crate::Stage,
    },

    /// Module rejected at load
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Module could not be instantiated
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),

    /// Image could not be read
    #[error(transparent)]
    ImageSource(#[from] ImageSourceError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
