use thiserror::Error;

/// imgcd error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed image reference supplied by the user
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Platform string outside the supported set
    #[error("Invalid platform '{given}' (supported: {supported})")]
    InvalidPlatform { given: String, supported: String },

    /// Registry request failed
    #[error("Registry error for {reference}: {message}")]
    Registry { reference: String, message: String },

    /// Registry rejected our credentials
    #[error("Unauthorized by registry {registry}")]
    Unauthorized { registry: String },

    /// No manifest for the requested platform
    #[error("No manifest found for {reference} on platform {platform}")]
    ManifestNotFound { reference: String, platform: String },

    /// A downloaded blob hashed to something other than its declared digest
    #[error("Digest mismatch for blob: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    /// A decompressed layer hashed to something other than its declared diffID
    #[error("DiffID mismatch for layer {index}: expected {expected}, got {actual}")]
    DiffIdMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    /// Bundle metadata references a blob that is not in the bundle
    #[error("Incomplete bundle: missing blob {digest}")]
    IncompleteBundle { digest: String },

    /// Bundle version we do not understand
    #[error("Unsupported bundle version: {0} (expected 2)")]
    UnsupportedBundleVersion(String),

    /// Local base image is missing or shorter than the shared layer chain
    #[error("Base image {base_ref} cannot satisfy this bundle: {message}")]
    BaseMismatch { base_ref: String, message: String },

    /// No container runtime detected where one is required
    #[error("No container runtime (docker or containerd) available")]
    NoRuntime,

    /// Cache lookup miss
    #[error("Blob not in cache: {digest}")]
    NotCached { digest: String },

    /// Cache-layer failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Structurally invalid bundle
    #[error("Bundle format error: {0}")]
    BundleFormat(String),

    /// Container runtime invocation failed
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for imgcd operations
pub type Result<T> = std::result::Result<T, Error>;
