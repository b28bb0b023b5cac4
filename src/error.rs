use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why the kernel refused an attach call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachFailure {
    SymbolRejected,
    InterfaceNotFound,
    PermissionDenied,
    /// Another live handle already covers the same target and probe kind
    AlreadyAttached,
}

impl fmt::Display for AttachFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AttachFailure::SymbolRejected => "symbol rejected",
            AttachFailure::InterfaceNotFound => "interface not found",
            AttachFailure::PermissionDenied => "permission denied",
            AttachFailure::AlreadyAttached => "already attached",
        };
        f.write_str(reason)
    }
}

#[derive(Error, Debug)]
pub enum TracekitError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to read program object {}: {source}", path.display())]
    ProgramSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid probe spec {}: {source}", path.display())]
    SpecParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Kernel symbol {primary} not found{}", fallback_note(.fallback))]
    SymbolNotFound {
        primary: String,
        fallback: Option<String>,
    },

    #[error("Failed to load program {entry_point}: {reason}")]
    Load { entry_point: String, reason: String },

    #[error("Failed to attach {entry_point} to {target} ({kind}): {reason}")]
    Attach {
        entry_point: String,
        target: String,
        kind: AttachFailure,
        reason: String,
    },

    #[error("Failed to detach {entry_point} from {target}: {reason}")]
    Detach {
        entry_point: String,
        target: String,
        reason: String,
    },

    #[error("Failed to read table {table}: {reason}")]
    Table { table: String, reason: String },

    #[error("Ring buffer {map}: {reason}")]
    RingBuffer { map: String, reason: String },

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    #[error("Unsupported on this platform: {0}")]
    UnsupportedPlatform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn fallback_note(fallback: &Option<String>) -> String {
    match fallback {
        Some(fallback) => format!(" (fallback {} not found either)", fallback),
        None => String::from(" and no fallback is declared"),
    }
}

pub type Result<T> = std::result::Result<T, TracekitError>;
