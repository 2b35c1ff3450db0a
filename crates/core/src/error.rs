//! Error types for world validation, backend setup and stepping
//!
//! Every failure in the core aborts the current run and is surfaced to the
//! caller as a [`HeatError`]. There is no local recovery or retry.

/// Errors raised while loading, validating or stepping a heat world
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeatError {
    /// No usable compute backend or adapter (fatal, raised before stepping)
    Configuration(String),
    /// Kernel source failed to build for the selected device
    Compilation(String),
    /// A buffer upload or download failed
    Transfer(String),
    /// A kernel dispatch failed or was malformed
    Dispatch(String),
    /// World dimensions, buffers or boundary marking are inconsistent
    InputValidity(String),
    /// Failed to read or write a world file
    Io(String),
    /// World file contents could not be decoded
    Format(String),
}

impl HeatError {
    /// Short category name, used in log fields
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Compilation(_) => "compilation",
            Self::Transfer(_) => "transfer",
            Self::Dispatch(_) => "dispatch",
            Self::InputValidity(_) => "input-validity",
            Self::Io(_) => "io",
            Self::Format(_) => "format",
        }
    }
}

impl std::fmt::Display for HeatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            Self::Compilation(msg) => write!(f, "Kernel compilation failed: {msg}"),
            Self::Transfer(msg) => write!(f, "Buffer transfer failed: {msg}"),
            Self::Dispatch(msg) => write!(f, "Kernel dispatch failed: {msg}"),
            Self::InputValidity(msg) => write!(f, "Invalid input world: {msg}"),
            Self::Io(msg) => write!(f, "World I/O failed: {msg}"),
            Self::Format(msg) => write!(f, "Malformed world data: {msg}"),
        }
    }
}

impl std::error::Error for HeatError {}

impl From<std::io::Error> for HeatError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for HeatError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e.to_string())
    }
}
