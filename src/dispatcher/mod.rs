//! The per-segment state machine: save source, insert into playlist, select
//! a session, optionally upload to orchestrator storage, submit, fan out N
//! rendition downloads, verify the aggregate signature, and retry
//! indefinitely on failure.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::DispatchError;
use crate::hash::{self, SegmentHash};
use crate::metrics::MetricsCore;
use crate::session::{BroadcastSession, SessionManager};
use crate::traits::{PlaylistManager, RpcClient, SignatureVerifier, StorageSession};
use crate::types::{Profile, RenditionOutcome, SourceSegment};

pub struct SegmentDispatcher {
    sessions: Arc<SessionManager>,
    broadcaster_storage: Arc<dyn StorageSession>,
    rpc: Arc<dyn RpcClient>,
    source_playlist: Arc<dyn PlaylistManager>,
    rendition_playlists: Arc<dyn PlaylistManager>,
    signature_verifier: Option<Arc<dyn SignatureVerifier>>,
    metrics: Arc<MetricsCore>,
    profiles: Vec<Profile>,
    cancellation: CancellationToken,
}

impl SegmentDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionManager>,
        broadcaster_storage: Arc<dyn StorageSession>,
        rpc: Arc<dyn RpcClient>,
        source_playlist: Arc<dyn PlaylistManager>,
        rendition_playlists: Arc<dyn PlaylistManager>,
        signature_verifier: Option<Arc<dyn SignatureVerifier>>,
        metrics: Arc<MetricsCore>,
        profiles: Vec<Profile>,
        cancellation: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            broadcaster_storage,
            rpc,
            source_playlist,
            rendition_playlists,
            signature_verifier,
            metrics,
            profiles,
            cancellation,
        })
    }

    /// Entry point for one source segment: save it, insert it into the
    /// source playlist, then spawn the asynchronous retry loop that drives
    /// it through submission and fan-out.
    #[instrument(skip(self, segment), fields(nonce = segment.nonce, seq_no = segment.seq_no))]
    pub async fn dispatch(self: &Arc<Self>, segment: SourceSegment) {
        let name = format!("source/{}.ts", segment.seq_no);
        let saved = self.broadcaster_storage.save(&name, segment.data.clone()).await;
        let uri = match saved {
            // An external storage session hands back a URI that replaces the
            // segment's conventional name for all downstream use; an
            // internal one just confirms the name we asked it to use.
            Ok(saved_uri) => {
                if self.broadcaster_storage.is_external() {
                    saved_uri
                } else {
                    name.clone()
                }
            }
            Err(err) => {
                warn!(?err, "failed to save source segment");
                self.metrics.segment_upload_failed(
                    segment.nonce,
                    segment.seq_no,
                    err.upload_error_code(),
                );
                return;
            }
        };

        if let Err(err) = self
            .source_playlist
            .insert_segment(
                &Profile::new("source"),
                segment.seq_no,
                &uri,
                segment.duration.as_secs_f64(),
            )
            .await
        {
            warn!(?err, "failed to insert source segment into playlist");
            self.metrics.segment_upload_failed(
                segment.nonce,
                segment.seq_no,
                err.upload_error_code(),
            );
            return;
        }

        self.metrics.segment_uploaded(segment.duration.as_secs_f64());
        self.metrics.segment_emerged(segment.nonce, segment.seq_no);
        for profile in &self.profiles {
            self.metrics.segment_source_appeared(profile);
        }

        let this = Arc::clone(self);
        let uri_for_submit = uri;
        let data = segment.data;
        tokio::spawn(async move {
            this.retry_loop(segment.nonce, segment.seq_no, uri_for_submit, data).await;
        });
    }

    /// Retries `transcode_segment` against fresh sessions until it returns
    /// `Ok(())` (success or `NoOrchestrators`) or the stream is cancelled.
    async fn retry_loop(self: &Arc<Self>, nonce: u64, seq_no: u64, uri: String, data: Bytes) {
        loop {
            if self.cancellation.is_cancelled() {
                debug!("dispatch retry loop observed stream cancellation");
                return;
            }
            match self.transcode_segment(nonce, seq_no, &uri, data.clone()).await {
                Ok(()) => return,
                Err(err) if !err.is_retryable() => {
                    debug!(?err, "dispatch loop exiting: non-retryable");
                    return;
                }
                Err(err) => {
                    warn!(?err, "segment dispatch failed, retrying");
                }
            }
        }
    }

    /// One attempt: select a session, submit, fan out downloads, verify.
    /// Returns `Ok(())` on success or on `NoOrchestrators` (nothing left to
    /// retry against); any other `Err` means the caller should retry.
    async fn transcode_segment(
        &self,
        nonce: u64,
        seq_no: u64,
        uri: &str,
        data: Bytes,
    ) -> Result<(), DispatchError> {
        let session = match self.sessions.select_session() {
            Some(s) => s,
            None => {
                self.metrics.segment_transcode_failed(
                    nonce,
                    seq_no,
                    DispatchError::NoOrchestrators.transcode_error_code(),
                );
                return Ok(());
            }
        };

        if let Some(orch_storage) = &session.orchestrator_storage {
            if let Err(err) = orch_storage.save(uri, data.clone()).await {
                self.sessions.remove_session(&session);
                self.metrics
                    .segment_transcode_failed(nonce, seq_no, err.transcode_error_code());
                return Err(DispatchError::ObjectStorage {
                    reason: err.to_string(),
                });
            }
        }

        let submit_start = std::time::Instant::now();
        let submit_result = self.rpc.submit(&session.orchestrator, seq_no, data).await;
        let response = match submit_result {
            Ok(res) if res.segments.is_empty() => {
                // An empty response means this orchestrator is broken for
                // this segment; drop it rather than completing it back into
                // the pool, or the next LIFO select would just hand it
                // straight back and spin forever.
                self.sessions.remove_session(&session);
                self.metrics.segment_transcode_failed(
                    nonce,
                    seq_no,
                    DispatchError::EmptyResponse.transcode_error_code(),
                );
                return Err(DispatchError::EmptyResponse);
            }
            Ok(res) => {
                self.sessions.complete_session(session);
                self.metrics
                    .segment_transcoded(submit_start.elapsed().as_secs_f64(), &self.profiles_label());
                res
            }
            Err(err) => {
                self.sessions.remove_session(&session);
                self.metrics
                    .segment_transcode_failed(nonce, seq_no, err.transcode_error_code());
                return Err(err);
            }
        };

        let outcomes = self.fanout_download(nonce, seq_no, &response.segments).await;

        let all_success = outcomes.iter().all(|o| o.hash.is_some());
        let first_error = outcomes.iter().find_map(|o| o.error.as_ref());

        if let (Some(sig), Some(recipient)) = (&response.sig, &response.recipient_address) {
            if let Some(verifier) = &self.signature_verifier {
                let hashes: Vec<SegmentHash> =
                    outcomes.iter().filter_map(|o| o.hash).collect();
                if hashes.len() == outcomes.len() {
                    let message = hash::signature_message(&hashes);
                    if !verifier.verify(recipient, &message, sig).await {
                        self.metrics.segment_transcode_failed(
                            nonce,
                            seq_no,
                            DispatchError::SignatureMismatch.transcode_error_code(),
                        );
                        return Err(DispatchError::SignatureMismatch);
                    }
                }
            }
        }

        let profiles_label = self.profiles_label();
        self.metrics.segment_fully_transcoded(
            nonce,
            seq_no,
            &profiles_label,
            all_success,
            first_error.map(|e| e.transcode_error_code()),
        );

        if let Some(err) = first_error {
            return Err(err.clone_for_retry());
        }
        Ok(())
    }

    fn profiles_label(&self) -> String {
        self.profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Concurrently downloads, hashes, saves, and inserts every rendition
    /// the orchestrator returned. Populates hashes in strict profile-index
    /// order even though the N tasks complete out of order.
    async fn fanout_download(
        &self,
        nonce: u64,
        seq_no: u64,
        renditions: &[crate::types::RenditionRef],
    ) -> Vec<RenditionOutcome> {
        let mut futs = FuturesUnordered::new();
        for (idx, rendition) in renditions.iter().enumerate() {
            let profile = rendition.profile.clone();
            let url = rendition.url.clone();
            futs.push(async move {
                let outcome = self.download_and_insert(nonce, seq_no, &profile, &url).await;
                (idx, outcome)
            });
        }

        let mut slots: Vec<Option<RenditionOutcome>> = (0..renditions.len()).map(|_| None).collect();
        while let Some((idx, outcome)) = futs.next().await {
            slots[idx] = Some(outcome);
        }
        slots.into_iter().map(|s| s.expect("every index populated")).collect()
    }

    async fn download_and_insert(
        &self,
        nonce: u64,
        seq_no: u64,
        profile: &Profile,
        url: &str,
    ) -> RenditionOutcome {
        let already_own = self.broadcaster_storage.is_own(url);

        let bytes = match self.broadcaster_storage.fetch(url).await {
            Ok(b) => b,
            Err(err) => {
                let wrapped = if matches!(err, DispatchError::SessionEnded) {
                    err
                } else {
                    DispatchError::Download {
                        reason: err.to_string(),
                    }
                };
                self.metrics
                    .segment_transcode_failed(nonce, seq_no, wrapped.transcode_error_code());
                return RenditionOutcome {
                    profile: profile.clone(),
                    hash: None,
                    error: Some(wrapped),
                };
            }
        };

        let digest = hash::keccak256(&bytes);

        let saved_uri = if already_own {
            url.to_string()
        } else {
            let save_name = format!("{}/{}.ts", profile.name, seq_no);
            match self.broadcaster_storage.save(&save_name, bytes).await {
                Ok(uri) => uri,
                Err(err) => {
                    let wrapped = if matches!(err, DispatchError::SessionEnded) {
                        err
                    } else {
                        DispatchError::SaveData {
                            reason: err.to_string(),
                        }
                    };
                    self.metrics
                        .segment_transcode_failed(nonce, seq_no, wrapped.transcode_error_code());
                    return RenditionOutcome {
                        profile: profile.clone(),
                        hash: None,
                        error: Some(wrapped),
                    };
                }
            }
        };

        self.metrics.segment_transcoded_appeared(nonce, seq_no, profile);

        if let Err(err) = self
            .rendition_playlists
            .insert_segment(profile, seq_no, &saved_uri, 0.0)
            .await
        {
            self.metrics
                .segment_transcode_failed(nonce, seq_no, err.transcode_error_code());
            return RenditionOutcome {
                profile: profile.clone(),
                hash: None,
                error: Some(err),
            };
        }

        RenditionOutcome {
            profile: profile.clone(),
            hash: Some(digest),
            error: None,
        }
    }
}

impl DispatchError {
    /// Errors surfaced per-rendition during fan-out retain their shape when
    /// propagated up as the segment-level retry error.
    fn clone_for_retry(&self) -> Self {
        match self {
            Self::Download { reason } => Self::Download {
                reason: reason.clone(),
            },
            Self::SaveData { reason } => Self::SaveData {
                reason: reason.clone(),
            },
            Self::Playlist { reason } => Self::Playlist {
                reason: reason.clone(),
            },
            Self::SessionEnded => Self::SessionEnded,
            other => Self::Internal {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPoolConfig;
    use crate::session::SessionFactory;
    use crate::types::{OrchestratorInfo, RenditionRef, SubmitResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MemStorage {
        blobs: StdMutex<std::collections::HashMap<String, Bytes>>,
    }

    impl MemStorage {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                blobs: StdMutex::new(std::collections::HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl StorageSession for MemStorage {
        async fn save(&self, name: &str, data: Bytes) -> Result<String, DispatchError> {
            self.blobs.lock().unwrap().insert(name.to_string(), data);
            Ok(name.to_string())
        }
        async fn fetch(&self, uri: &str) -> Result<Bytes, DispatchError> {
            self.blobs
                .lock()
                .unwrap()
                .get(uri)
                .cloned()
                .ok_or_else(|| DispatchError::Download {
                    reason: "not found".into(),
                })
        }
        fn is_external(&self) -> bool {
            false
        }
        fn is_own(&self, uri: &str) -> bool {
            self.blobs.lock().unwrap().contains_key(uri)
        }
    }

    struct FakeRpc {
        profiles: Vec<Profile>,
    }

    #[async_trait]
    impl RpcClient for FakeRpc {
        async fn submit(
            &self,
            _orchestrator: &OrchestratorInfo,
            seq_no: u64,
            _data: Bytes,
        ) -> Result<SubmitResponse, DispatchError> {
            Ok(SubmitResponse {
                segments: self
                    .profiles
                    .iter()
                    .map(|p| RenditionRef {
                        profile: p.clone(),
                        url: format!("rendition/{}/{}.ts", p.name, seq_no),
                    })
                    .collect(),
                sig: None,
                recipient_address: None,
            })
        }
    }

    struct NoopPlaylist {
        inserted: StdMutex<Vec<(String, u64)>>,
    }

    impl NoopPlaylist {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inserted: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PlaylistManager for NoopPlaylist {
        async fn insert_segment(
            &self,
            profile: &Profile,
            seq_no: u64,
            _uri: &str,
            _duration_secs: f64,
        ) -> Result<(), DispatchError> {
            self.inserted
                .lock()
                .unwrap()
                .push((profile.name.clone(), seq_no));
            Ok(())
        }
    }

    struct OneShotFactory(AtomicUsize);

    #[async_trait]
    impl SessionFactory for OneShotFactory {
        async fn create_sessions(&self, _count: usize) -> Vec<BroadcastSession> {
            if self.0.fetch_add(1, Ordering::SeqCst) > 0 {
                return Vec::new();
            }
            vec![BroadcastSession {
                orchestrator: OrchestratorInfo {
                    transport_addr: "orch-1".into(),
                    preferred_storage: None,
                    payment_session_id: None,
                },
                broadcaster_storage: MemStorage::new(),
                orchestrator_storage: None,
            }]
        }
    }

    #[tokio::test]
    async fn dispatch_with_no_sessions_records_no_orchestrators_and_returns() {
        let storage = MemStorage::new();
        let metrics = Arc::new(MetricsCore::new(
            prometheus::Registry::new(),
            crate::config::AveragerConfig::default(),
        ));
        metrics.stream_created(1);
        let sessions = SessionManager::new(
            SessionPoolConfig::default(),
            Arc::new(OneShotFactory(AtomicUsize::new(1))), // already "exhausted"
        );
        let dispatcher = SegmentDispatcher::new(
            sessions,
            storage,
            Arc::new(FakeRpc {
                profiles: vec![Profile::new("720p")],
            }),
            NoopPlaylist::new(),
            NoopPlaylist::new(),
            None,
            Arc::clone(&metrics),
            vec![Profile::new("720p")],
            CancellationToken::new(),
        );

        let segment = SourceSegment {
            nonce: 1,
            seq_no: 1,
            data: Bytes::from_static(b"hello"),
            duration: std::time::Duration::from_secs(2),
        };
        dispatcher.dispatch(segment).await;
        // allow the spawned retry loop to run to completion
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
