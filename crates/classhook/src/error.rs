use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no module information has been established")]
    NoModuleInfo,

    #[error("image magic mismatch at offset {offset:#x}: found {found:#x}")]
    BadImageMagic { offset: usize, found: u32 },

    #[error("image truncated while reading at offset {offset:#x}")]
    ImageTruncated { offset: usize },

    #[error("required section missing: {0}")]
    MissingSection(String),

    #[error("class not found: {0}")]
    ClassNotFound(String),

    #[error("executable allocation of {0} bytes failed")]
    AllocationFailed(usize),

    #[error("page protection change failed at {address:#x}: {message}")]
    ProtectionFailed { address: usize, message: String },

    #[error("unable to demangle symbol '{0}'")]
    DemangleFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is a "file not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
