//! Thread-safe facade over a Prometheus registry plus the per-stream
//! bookkeeping (`emergeTimes`, success averagers) that the dispatcher and
//! watchdog mutate. Counters/histograms follow the same
//! `register_*_with_registry!` pattern used for labeled streaming metrics
//! elsewhere in this codebase; the emerge-time/averager maps follow the
//! plain-struct-behind-a-mutex shape used for in-process pool state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use prometheus::core::{GenericCounterVec, GenericGaugeVec};
use prometheus::{
    exponential_buckets, histogram_opts, register_gauge_vec_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, HistogramVec,
    Registry,
};

use crate::config::AveragerConfig;
use crate::error::{TranscodeErrorCode, UploadErrorCode};
use crate::session::SegmentsAverager;
use crate::types::{Nonce, Profile, SeqNo};

pub struct MetricsCore {
    registry: Registry,
    averager_config: AveragerConfig,

    segment_source_appeared: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_source_emerged: prometheus::IntCounter,
    segment_source_emerged_with_profiles: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_source_uploaded: prometheus::IntCounter,
    segment_source_upload_failed: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_transcoded: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_transcode_failed: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_transcoded_appeared: GenericCounterVec<prometheus::core::AtomicU64>,
    segment_transcoded_all_appeared: GenericCounterVec<prometheus::core::AtomicU64>,
    stream_created: prometheus::IntCounter,
    stream_started: prometheus::IntCounter,
    stream_ended: prometheus::IntCounter,
    stream_create_failed: prometheus::IntCounter,
    max_sessions: prometheus::IntGauge,
    current_sessions: prometheus::IntGauge,
    discovery_errors: GenericCounterVec<prometheus::core::AtomicU64>,
    success_rate: GenericGaugeVec<prometheus::core::AtomicF64>,
    transcode_time_seconds: HistogramVec,
    transcode_latency_seconds: HistogramVec,
    transcode_overall_latency_seconds: HistogramVec,
    upload_time_seconds: HistogramVec,

    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    emerge_times: HashMap<Nonce, HashMap<SeqNo, Instant>>,
    success: HashMap<Nonce, SegmentsAverager>,
}

impl MetricsCore {
    pub fn new(registry: Registry, averager_config: AveragerConfig) -> Self {
        let segment_source_appeared = register_int_counter_vec_with_registry!(
            "livepeer_segment_source_appeared_total",
            "Total number of source segments observed",
            &["node_id", "node_type", "profile"],
            registry
        )
        .unwrap();

        let segment_source_emerged = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_segment_source_emerged_total",
            "Total number of source segments whose outcome has resolved",
        ))
        .unwrap();
        registry
            .register(Box::new(segment_source_emerged.clone()))
            .unwrap();

        let segment_source_emerged_with_profiles = register_int_counter_vec_with_registry!(
            "livepeer_segment_source_emerged_with_profiles_total",
            "Total number of source segments resolved, labeled by profile set",
            &["node_id", "node_type", "profiles"],
            registry
        )
        .unwrap();

        let segment_source_uploaded = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_segment_source_uploaded_total",
            "Total number of source segments successfully uploaded",
        ))
        .unwrap();
        registry
            .register(Box::new(segment_source_uploaded.clone()))
            .unwrap();

        let segment_source_upload_failed = register_int_counter_vec_with_registry!(
            "livepeer_segment_source_upload_failed_total",
            "Total number of source segment upload failures",
            &["node_id", "node_type", "error_code"],
            registry
        )
        .unwrap();

        let segment_transcoded = register_int_counter_vec_with_registry!(
            "livepeer_segment_transcoded_total",
            "Total number of segments transcoded",
            &["node_id", "node_type", "profiles"],
            registry
        )
        .unwrap();

        let segment_transcode_failed = register_int_counter_vec_with_registry!(
            "livepeer_segment_transcode_failed_total",
            "Total number of segment transcode failures",
            &["node_id", "node_type", "error_code"],
            registry
        )
        .unwrap();

        let segment_transcoded_appeared = register_int_counter_vec_with_registry!(
            "livepeer_segment_transcoded_appeared_total",
            "Total number of transcoded renditions that appeared, per profile",
            &["node_id", "node_type", "profile"],
            registry
        )
        .unwrap();

        let segment_transcoded_all_appeared = register_int_counter_vec_with_registry!(
            "livepeer_segment_transcoded_all_appeared_total",
            "Total number of segments whose renditions all appeared",
            &["node_id", "node_type", "profiles"],
            registry
        )
        .unwrap();

        let stream_created = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_stream_created_total",
            "Total number of streams created",
        ))
        .unwrap();
        registry.register(Box::new(stream_created.clone())).unwrap();

        let stream_started = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_stream_started_total",
            "Total number of streams started",
        ))
        .unwrap();
        registry.register(Box::new(stream_started.clone())).unwrap();

        let stream_ended = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_stream_ended_total",
            "Total number of streams ended",
        ))
        .unwrap();
        registry.register(Box::new(stream_ended.clone())).unwrap();

        let stream_create_failed = prometheus::IntCounter::with_opts(prometheus::Opts::new(
            "livepeer_stream_create_failed_total",
            "Total number of stream creation failures",
        ))
        .unwrap();
        registry
            .register(Box::new(stream_create_failed.clone()))
            .unwrap();

        let max_sessions = prometheus::IntGauge::with_opts(prometheus::Opts::new(
            "livepeer_max_sessions_total",
            "Configured upper bound of orchestrator sessions per stream",
        ))
        .unwrap();
        registry.register(Box::new(max_sessions.clone())).unwrap();

        let current_sessions = prometheus::IntGauge::with_opts(prometheus::Opts::new(
            "livepeer_current_sessions_total",
            "Current number of orchestrator sessions in the pool",
        ))
        .unwrap();
        registry
            .register(Box::new(current_sessions.clone()))
            .unwrap();

        let discovery_errors = register_int_counter_vec_with_registry!(
            "livepeer_discovery_errors_total",
            "Total number of orchestrator discovery errors",
            &["node_id", "node_type", "error_code"],
            registry
        )
        .unwrap();

        let success_rate = register_gauge_vec_with_registry!(
            "livepeer_success_rate",
            "Rolling success rate over the last resolved source segments per stream",
            &["node_id", "node_type"],
            registry
        )
        .unwrap();

        let transcode_time_opts = histogram_opts!(
            "livepeer_transcode_time_seconds",
            "Wall time to transcode a segment across its renditions",
            exponential_buckets(0.01, 2.0, 16).unwrap() // max ~164s
        );
        let transcode_time_seconds = register_histogram_vec_with_registry!(
            transcode_time_opts,
            &["node_id", "node_type", "profiles"],
            registry
        )
        .unwrap();

        let transcode_latency_opts = histogram_opts!(
            "livepeer_transcode_latency_seconds",
            "Latency from source segment emerged to one rendition appearing",
            exponential_buckets(0.01, 2.0, 16).unwrap()
        );
        let transcode_latency_seconds = register_histogram_vec_with_registry!(
            transcode_latency_opts,
            &["node_id", "node_type", "profile"],
            registry
        )
        .unwrap();

        let transcode_overall_latency_opts = histogram_opts!(
            "livepeer_transcode_overall_latency_seconds",
            "Latency from source segment emerged to all renditions appearing",
            exponential_buckets(0.01, 2.0, 16).unwrap()
        );
        let transcode_overall_latency_seconds = register_histogram_vec_with_registry!(
            transcode_overall_latency_opts,
            &["node_id", "node_type", "profiles"],
            registry
        )
        .unwrap();

        let upload_time_opts = histogram_opts!(
            "livepeer_upload_time_seconds",
            "Time to upload a source segment to broadcaster storage",
            exponential_buckets(0.005, 2.0, 14).unwrap()
        );
        let upload_time_seconds = register_histogram_vec_with_registry!(
            upload_time_opts,
            &["node_id", "node_type"],
            registry
        )
        .unwrap();

        Self {
            registry,
            averager_config,
            segment_source_appeared,
            segment_source_emerged,
            segment_source_emerged_with_profiles,
            segment_source_uploaded,
            segment_source_upload_failed,
            segment_transcoded,
            segment_transcode_failed,
            segment_transcoded_appeared,
            segment_transcoded_all_appeared,
            stream_created,
            stream_started,
            stream_ended,
            stream_create_failed,
            max_sessions,
            current_sessions,
            discovery_errors,
            success_rate,
            transcode_time_seconds,
            transcode_latency_seconds,
            transcode_overall_latency_seconds,
            upload_time_seconds,
            state: Mutex::new(State::default()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stream_created(&self, nonce: Nonce) {
        self.stream_created.inc();
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.success.insert(
            nonce,
            SegmentsAverager::new(
                self.averager_config.window,
                self.averager_config.time_to_wait_for_error,
            ),
        );
        state.emerge_times.insert(nonce, HashMap::new());
    }

    pub fn stream_started(&self) {
        self.stream_started.inc();
    }

    pub fn stream_create_failed(&self) {
        self.stream_create_failed.inc();
    }

    pub fn stream_ended(&self, nonce: Nonce) {
        self.stream_ended.inc();
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.emerge_times.remove(&nonce);
        let removable = state
            .success
            .get(&nonce)
            .map(|a| a.can_be_removed())
            .unwrap_or(true);
        if removable {
            state.success.remove(&nonce);
        } else if let Some(avg) = state.success.get_mut(&nonce) {
            avg.mark_removed();
        }
    }

    pub fn segment_source_appeared(&self, profile: &Profile) {
        self.segment_source_appeared
            .with_label_values(&["", "", &profile.name])
            .inc();
    }

    pub fn segment_emerged(&self, nonce: Nonce, seq_no: SeqNo) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state
            .emerge_times
            .entry(nonce)
            .or_default()
            .insert(seq_no, Instant::now());
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_emerged(seq_no);
        }
    }

    fn close_emerge_time(state: &mut State, nonce: Nonce, seq_no: SeqNo) {
        if let Some(map) = state.emerge_times.get_mut(&nonce) {
            map.remove(&seq_no);
        }
    }

    pub fn segment_uploaded(&self, duration_secs: f64) {
        self.segment_source_uploaded.inc();
        self.upload_time_seconds
            .with_label_values(&["", ""])
            .observe(duration_secs);
    }

    pub fn segment_upload_failed(&self, nonce: Nonce, seq_no: SeqNo, code: UploadErrorCode) {
        self.segment_source_emerged.inc();
        self.segment_source_upload_failed
            .with_label_values(&["", "", code.as_ref()])
            .inc();
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        Self::close_emerge_time(&mut state, nonce, seq_no);
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, true);
        }
        self.recompute_success_rate(&mut state, nonce);
    }

    pub fn segment_transcoded(&self, duration_secs: f64, profiles: &str) {
        self.segment_transcoded
            .with_label_values(&["", "", profiles])
            .inc();
        self.transcode_time_seconds
            .with_label_values(&["", "", profiles])
            .observe(duration_secs);
    }

    pub fn segment_transcode_failed(&self, nonce: Nonce, seq_no: SeqNo, code: TranscodeErrorCode) {
        self.segment_transcode_failed
            .with_label_values(&["", "", code.as_ref()])
            .inc();
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        Self::close_emerge_time(&mut state, nonce, seq_no);
        let failed = code != TranscodeErrorCode::SessionEnded;
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, failed);
        }
        self.recompute_success_rate(&mut state, nonce);
    }

    pub fn segment_transcoded_appeared(&self, nonce: Nonce, seq_no: SeqNo, profile: &Profile) {
        self.segment_transcoded_appeared
            .with_label_values(&["", "", &profile.name])
            .inc();
        let state = self.state.lock().expect("metrics mutex poisoned");
        if let Some(emerged_at) = state
            .emerge_times
            .get(&nonce)
            .and_then(|m| m.get(&seq_no))
        {
            let elapsed = emerged_at.elapsed().as_secs_f64();
            self.transcode_latency_seconds
                .with_label_values(&["", "", &profile.name])
                .observe(elapsed);
        }
    }

    pub fn segment_fully_transcoded(
        &self,
        nonce: Nonce,
        seq_no: SeqNo,
        profiles: &str,
        all_success: bool,
        err_code: Option<TranscodeErrorCode>,
    ) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        if all_success {
            if let Some(emerged_at) = state
                .emerge_times
                .get(&nonce)
                .and_then(|m| m.get(&seq_no))
            {
                let elapsed = emerged_at.elapsed().as_secs_f64();
                self.transcode_overall_latency_seconds
                    .with_label_values(&["", "", profiles])
                    .observe(elapsed);
            }
            self.segment_transcoded_all_appeared
                .with_label_values(&["", "", profiles])
                .inc();
        }
        Self::close_emerge_time(&mut state, nonce, seq_no);
        let failed = !all_success && err_code != Some(TranscodeErrorCode::SessionEnded);
        if let Some(avg) = state.success.get_mut(&nonce) {
            avg.add_transcoded(seq_no, failed);
        }
        self.recompute_success_rate(&mut state, nonce);
    }

    pub fn discovery_error(&self, code: crate::error::DiscoveryErrorCode) {
        self.discovery_errors
            .with_label_values(&["", "", code.as_ref()])
            .inc();
    }

    pub fn set_session_gauges(&self, max_sessions: i64, current_sessions: i64) {
        self.max_sessions.set(max_sessions);
        self.current_sessions.set(current_sessions);
    }

    fn recompute_success_rate(&self, state: &mut State, nonce: Nonce) {
        if let Some(avg) = state.success.get(&nonce) {
            let (rate, had_any) = avg.success_rate();
            if had_any {
                self.success_rate.with_label_values(&["", ""]).set(rate);
            }
        }
    }

    /// Invoked by the watchdog sweep: ages out every `emerge_times` entry
    /// older than the grace deadline and reaps ended-stream averagers past
    /// their own grace period. Driving off `emerge_times` rather than the
    /// bounded averager ring means a source segment evicted from the ring
    /// (the 31st+ unresolved segment within the window) still gets aged out
    /// instead of leaking its entry forever. Returns the number of segments
    /// aged out, for logging.
    pub fn sweep(&self) -> usize {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        let ttw = self.averager_config.time_to_wait_for_error;
        let now = Instant::now();
        let nonces: Vec<Nonce> = state.emerge_times.keys().copied().collect();
        let mut aged_total = 0;
        for nonce in nonces {
            let aged_seq_nos: Vec<SeqNo> = state
                .emerge_times
                .get(&nonce)
                .map(|m| {
                    m.iter()
                        .filter(|(_, emerged_at)| {
                            now.saturating_duration_since(**emerged_at) > ttw
                        })
                        .map(|(seq_no, _)| *seq_no)
                        .collect()
                })
                .unwrap_or_default();
            for seq_no in aged_seq_nos {
                Self::close_emerge_time(&mut state, nonce, seq_no);
                if let Some(avg) = state.success.get_mut(&nonce) {
                    avg.add_transcoded(seq_no, true);
                }
                self.segment_source_emerged.inc();
                self.segment_transcode_failed
                    .with_label_values(&["", "", TranscodeErrorCode::LostSegment.as_ref()])
                    .inc();
                aged_total += 1;
            }
            self.recompute_success_rate(&mut state, nonce);
        }
        state.success.retain(|_, avg| !(avg.is_removed() && avg.should_reap()));
        aged_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> MetricsCore {
        MetricsCore::new(Registry::new(), AveragerConfig::default())
    }

    #[test]
    fn stream_created_then_ended_with_no_segments_removes_state() {
        let m = metrics();
        m.stream_created(1);
        m.stream_ended(1);
        let state = m.state.lock().unwrap();
        assert!(!state.success.contains_key(&1));
        assert!(!state.emerge_times.contains_key(&1));
    }

    #[test]
    fn stream_ended_with_unresolved_segment_keeps_averager_marked_removed() {
        let m = metrics();
        m.stream_created(1);
        m.segment_emerged(1, 7);
        m.stream_ended(1);
        let state = m.state.lock().unwrap();
        let avg = state.success.get(&1).expect("averager retained until resolved");
        assert!(avg.is_removed());
    }

    #[test]
    fn upload_failed_resolves_the_segment_and_updates_rate() {
        let m = metrics();
        m.stream_created(42);
        m.segment_emerged(42, 1);
        m.segment_upload_failed(42, 1, UploadErrorCode::ObjectStorage);
        let state = m.state.lock().unwrap();
        assert!(!state.emerge_times[&42].contains_key(&1));
    }

    #[test]
    fn session_ended_transcode_failure_does_not_count_as_failed() {
        let m = metrics();
        m.stream_created(1);
        m.segment_emerged(1, 1);
        m.segment_transcode_failed(1, 1, TranscodeErrorCode::SessionEnded);
        let state = m.state.lock().unwrap();
        let avg = state.success.get(&1).unwrap();
        let (rate, had_any) = avg.success_rate();
        assert!(had_any);
        assert_eq!(rate, 1.0, "SessionEnded is an infrastructure event, not a failure");
    }
}
