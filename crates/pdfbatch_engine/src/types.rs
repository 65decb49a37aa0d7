use std::fmt;
use std::path::PathBuf;

/// Classified reason a single URL could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    Network,
    NotPdf { content_type: String },
    TooSmall { bytes: u64 },
    Io,
}

impl FailureKind {
    /// Transient faults worth another attempt. Content mismatches and client
    /// errors are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Timeout | FailureKind::Network => true,
            FailureKind::HttpStatus(code) => *code >= 500 || *code == 429,
            FailureKind::InvalidUrl
            | FailureKind::NotPdf { .. }
            | FailureKind::TooSmall { .. }
            | FailureKind::Io => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::NotPdf { content_type } => {
                write!(f, "not a pdf (content type {content_type:?})")
            }
            FailureKind::TooSmall { bytes } => {
                write!(f, "file too small ({bytes} bytes), probably empty")
            }
            FailureKind::Io => write!(f, "disk write error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

/// A PDF written to the target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPdf {
    pub filename: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Result of fetching one URL. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub url: String,
    pub index: usize,
    pub attempts: u32,
    pub result: Result<SavedPdf, FetchError>,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn filename(&self) -> Option<&str> {
        self.result.as_ref().ok().map(|saved| saved.filename.as_str())
    }

    pub fn bytes(&self) -> u64 {
        self.result.as_ref().map(|saved| saved.bytes).unwrap_or(0)
    }

    /// Short, human readable error class for failure listings.
    pub fn error_class(&self) -> Option<String> {
        self.result.as_ref().err().map(|err| err.kind.to_string())
    }
}
