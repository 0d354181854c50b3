//! Plain data types shared across the dispatch core and its external
//! collaborators.

use std::time::Duration;

use bytes::Bytes;

use crate::hash::SegmentHash;

/// Opaque identifier for a live stream instance.
pub type Nonce = u64;

/// Monotonically increasing per-stream segment index.
pub type SeqNo = u64;

/// Identifies a rendition profile (resolution/bitrate) to transcode into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Profile {
    pub name: String,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A source segment handed to the dispatcher for one `(nonce, seq_no)`.
#[derive(Debug, Clone)]
pub struct SourceSegment {
    pub nonce: Nonce,
    pub seq_no: SeqNo,
    pub data: Bytes,
    pub duration: Duration,
}

/// One orchestrator candidate returned by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrchestratorInfo {
    /// Transport address; the unique key for session pool membership.
    pub transport_addr: String,
    pub preferred_storage: Option<String>,
    pub payment_session_id: Option<String>,
}

/// One rendition returned by the orchestrator's submit RPC, before download.
#[derive(Debug, Clone)]
pub struct RenditionRef {
    pub profile: Profile,
    pub url: String,
}

/// Response to a segment submit call.
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub segments: Vec<RenditionRef>,
    pub sig: Option<Bytes>,
    pub recipient_address: Option<String>,
}

/// Outcome of one rendition's fan-out download/save/hash/insert.
#[derive(Debug)]
pub struct RenditionOutcome {
    pub profile: Profile,
    pub hash: Option<SegmentHash>,
    pub error: Option<crate::error::DispatchError>,
}
