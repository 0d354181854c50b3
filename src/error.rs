//! Error taxonomy for the dispatch core: recoverable, session-fatal, and
//! stream-fatal, mirroring the classification style of a download engine's
//! error enum rather than a flat bag of strings.

use std::fmt;

/// Error codes recorded as Prometheus label values. Kept separate from
/// [`DispatchError`] because the same underlying error can surface under a
/// different code depending on which stage observed it (upload vs. transcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadErrorCode {
    Unknown,
    GenCreds,
    ObjectStorage,
    SessionEnded,
    Timeout,
}

impl AsRef<str> for UploadErrorCode {
    fn as_ref(&self) -> &str {
        match self {
            Self::Unknown => "Unknown",
            Self::GenCreds => "GenCreds",
            Self::ObjectStorage => "ObjectStorage",
            Self::SessionEnded => "SessionEnded",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for UploadErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TranscodeErrorCode {
    Unknown,
    UnknownResponse,
    Transcode,
    OrchestratorBusy,
    OrchestratorCapped,
    ParseResponse,
    ReadBody,
    NoOrchestrators,
    Download,
    SaveData,
    SessionEnded,
    Playlist,
    /// Synthesised by the watchdog when a segment ages out unresolved.
    LostSegment,
}

impl AsRef<str> for TranscodeErrorCode {
    fn as_ref(&self) -> &str {
        match self {
            Self::Unknown => "Unknown",
            Self::UnknownResponse => "UnknownResponse",
            Self::Transcode => "Transcode",
            Self::OrchestratorBusy => "OrchestratorBusy",
            Self::OrchestratorCapped => "OrchestratorCapped",
            Self::ParseResponse => "ParseResponse",
            Self::ReadBody => "ReadBody",
            Self::NoOrchestrators => "NoOrchestrators",
            Self::Download => "Download",
            Self::SaveData => "SaveData",
            Self::SessionEnded => "SessionEnded",
            Self::Playlist => "Playlist",
            Self::LostSegment => "LostSegment",
        }
    }
}

impl fmt::Display for TranscodeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryErrorCode {
    Unknown,
    OrchestratorCapped,
    Canceled,
}

impl AsRef<str> for DiscoveryErrorCode {
    fn as_ref(&self) -> &str {
        match self {
            Self::Unknown => "Unknown",
            Self::OrchestratorCapped => "OrchestratorCapped",
            Self::Canceled => "Canceled",
        }
    }
}

/// Normalises a passthrough discovery error string into one of the known
/// tokens, falling back to `Unknown` for anything else.
pub fn normalise_discovery_error(reason: &str) -> DiscoveryErrorCode {
    if reason.contains("OrchestratorCapped") {
        DiscoveryErrorCode::OrchestratorCapped
    } else if reason.contains("Canceled") {
        DiscoveryErrorCode::Canceled
    } else {
        DiscoveryErrorCode::Unknown
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no orchestrators available")]
    NoOrchestrators,

    #[error("object storage error: {reason}")]
    ObjectStorage { reason: String },

    #[error("storage session ended")]
    SessionEnded,

    #[error("empty response from orchestrator")]
    EmptyResponse,

    #[error("orchestrator rejected segment: {reason}")]
    OrchestratorRejected { reason: String, code: &'static str },

    #[error("rendition download failed: {reason}")]
    Download { reason: String },

    #[error("failed to save rendition: {reason}")]
    SaveData { reason: String },

    #[error("playlist insertion failed: {reason}")]
    Playlist { reason: String },

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("discovery error: {reason}")]
    Discovery { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DispatchError {
    /// Whether the dispatch loop should retry against a fresh session.
    /// `NoOrchestrators` is the sole non-retryable terminal condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NoOrchestrators)
    }

    /// Whether the *session* (not just the attempt) should be dropped from
    /// the pool before retrying.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionEnded | Self::ObjectStorage { .. } | Self::OrchestratorRejected { .. }
        )
    }

    /// Reserved for a caller-supplied predicate; nothing in this core closes
    /// the stream on its own.
    pub fn is_stream_fatal(&self) -> bool {
        false
    }

    pub fn upload_error_code(&self) -> UploadErrorCode {
        match self {
            Self::SessionEnded => UploadErrorCode::SessionEnded,
            Self::ObjectStorage { .. } => UploadErrorCode::ObjectStorage,
            Self::Internal { .. } => UploadErrorCode::GenCreds,
            _ => UploadErrorCode::Unknown,
        }
    }

    pub fn transcode_error_code(&self) -> TranscodeErrorCode {
        match self {
            Self::NoOrchestrators => TranscodeErrorCode::NoOrchestrators,
            Self::SessionEnded => TranscodeErrorCode::SessionEnded,
            Self::Download { .. } => TranscodeErrorCode::Download,
            Self::SaveData { .. } => TranscodeErrorCode::SaveData,
            Self::Playlist { .. } => TranscodeErrorCode::Playlist,
            Self::EmptyResponse => TranscodeErrorCode::UnknownResponse,
            Self::OrchestratorRejected { code, .. } => match *code {
                "busy" => TranscodeErrorCode::OrchestratorBusy,
                "capped" => TranscodeErrorCode::OrchestratorCapped,
                _ => TranscodeErrorCode::Transcode,
            },
            Self::SignatureMismatch => TranscodeErrorCode::Transcode,
            _ => TranscodeErrorCode::Unknown,
        }
    }
}
