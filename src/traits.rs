//! External collaborator interfaces. Everything here is a trait with no
//! concrete network/crypto implementation in this crate: object storage, the
//! orchestrator discovery pool, the RPC submit call, playlist insertion, and
//! signature verification are all pluggable.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DispatchError;
use crate::types::{OrchestratorInfo, Profile, SeqNo, SubmitResponse};

/// A named-blob store scoped to one broadcaster or orchestrator session.
#[async_trait]
pub trait StorageSession: Send + Sync {
    async fn save(&self, name: &str, data: Bytes) -> Result<String, DispatchError>;
    async fn fetch(&self, uri: &str) -> Result<Bytes, DispatchError>;
    fn is_external(&self) -> bool;
    fn is_own(&self, uri: &str) -> bool;
}

/// Submits one segment to a selected orchestrator and returns its rendition
/// references plus an aggregate signature over their hashes.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn submit(
        &self,
        orchestrator: &OrchestratorInfo,
        seq_no: SeqNo,
        data: Bytes,
    ) -> Result<SubmitResponse, DispatchError>;
}

/// Inserts segment URIs into per-profile (or source) playlists.
#[async_trait]
pub trait PlaylistManager: Send + Sync {
    async fn insert_segment(
        &self,
        profile: &Profile,
        seq_no: SeqNo,
        uri: &str,
        duration_secs: f64,
    ) -> Result<(), DispatchError>;
}

/// Verifies an aggregate signature over a 32-byte message. The actual
/// elliptic-curve recovery math lives outside this crate.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, recipient_address: &str, message: &[u8; 32], sig: &[u8]) -> bool;
}
