//! Fixed-capacity ring buffer tracking per-segment emerged/transcoded
//! outcomes for one stream, used to compute a rolling success rate.

use std::time::{Duration, Instant};

use crate::types::SeqNo;

#[derive(Debug, Clone, Copy)]
struct SegmentCount {
    seq_no: SeqNo,
    emerged_time: Instant,
    emerged: bool,
    transcoded: bool,
    failed: bool,
}

/// Sliding window of the last `capacity` source segments for one stream.
pub struct SegmentsAverager {
    segments: Vec<Option<SegmentCount>>,
    capacity: usize,
    start: usize,
    /// `None` means the ring is empty.
    end: Option<usize>,
    time_to_wait_for_error: Duration,
    removed: Option<Instant>,
}

impl SegmentsAverager {
    pub fn new(capacity: usize, time_to_wait_for_error: Duration) -> Self {
        Self {
            segments: vec![None; capacity],
            capacity,
            start: 0,
            end: None,
            time_to_wait_for_error,
            removed: None,
        }
    }

    fn advance(&self, idx: usize) -> usize {
        (idx + 1) % self.capacity
    }

    fn find_slot(&self, seq_no: SeqNo) -> Option<usize> {
        let end = self.end?;
        let mut idx = self.start;
        loop {
            if let Some(slot) = self.segments[idx] {
                if slot.seq_no == seq_no {
                    return Some(idx);
                }
            }
            if idx == end {
                return None;
            }
            idx = self.advance(idx);
        }
    }

    fn append(&mut self) -> usize {
        match self.end {
            None => {
                self.start = 0;
                self.end = Some(0);
                0
            }
            Some(end) => {
                let next = self.advance(end);
                if next == self.start && self.segments[self.start].is_some() {
                    // ring is full: evict the oldest
                    self.start = self.advance(self.start);
                }
                self.end = Some(next);
                next
            }
        }
    }

    pub fn add_emerged(&mut self, seq_no: SeqNo) {
        let now = Instant::now();
        let idx = self.find_slot(seq_no).unwrap_or_else(|| self.append());
        self.segments[idx] = Some(SegmentCount {
            seq_no,
            emerged_time: now,
            emerged: true,
            transcoded: false,
            failed: false,
        });
    }

    pub fn add_transcoded(&mut self, seq_no: SeqNo, failed: bool) {
        let now = Instant::now();
        match self.find_slot(seq_no) {
            Some(idx) => {
                let slot = self.segments[idx].as_mut().expect("slot located by find_slot");
                slot.failed = failed;
                slot.transcoded = !failed;
            }
            None => {
                let idx = self.append();
                self.segments[idx] = Some(SegmentCount {
                    seq_no,
                    emerged_time: now,
                    emerged: false,
                    transcoded: !failed,
                    failed,
                });
            }
        }
    }

    fn is_resolved(&self, slot: &SegmentCount, now: Instant) -> bool {
        slot.transcoded
            || slot.failed
            || now.saturating_duration_since(slot.emerged_time) > self.time_to_wait_for_error
    }

    fn iter_slots(&self) -> impl Iterator<Item = &SegmentCount> {
        let end = self.end;
        let mut idx = self.start;
        let mut done = end.is_none();
        std::iter::from_fn(move || {
            if done {
                return None;
            }
            let slot = self.segments[idx].as_ref();
            if Some(idx) == end {
                done = true;
            } else {
                idx = (idx + 1) % self.segments.len();
            }
            slot
        })
    }

    /// Returns `(rate, had_any)`. `had_any` is false when there are no
    /// resolved slots yet, in which case `rate` is `1.0` by convention.
    pub fn success_rate(&self) -> (f64, bool) {
        let now = Instant::now();
        let mut emerged_sum = 0u64;
        let mut transcoded_sum = 0u64;
        for slot in self.iter_slots() {
            if !self.is_resolved(slot, now) {
                continue;
            }
            emerged_sum += 1;
            if slot.transcoded {
                transcoded_sum += 1;
            }
        }
        if emerged_sum == 0 {
            (1.0, false)
        } else {
            (transcoded_sum as f64 / emerged_sum as f64, true)
        }
    }

    pub fn can_be_removed(&self) -> bool {
        let now = Instant::now();
        self.iter_slots().all(|slot| self.is_resolved(slot, now))
    }

    pub fn mark_removed(&mut self) {
        if self.removed.is_none() {
            self.removed = Some(Instant::now());
        }
    }

    pub fn is_removed(&self) -> bool {
        self.removed.is_some()
    }

    /// Whether this averager should be reaped, i.e. it was marked removed
    /// more than `2 * time_to_wait_for_error` ago.
    pub fn should_reap(&self) -> bool {
        match self.removed {
            Some(at) => Instant::now().saturating_duration_since(at) > 2 * self.time_to_wait_for_error,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn averager() -> SegmentsAverager {
        SegmentsAverager::new(3, Duration::from_millis(50))
    }

    #[test]
    fn add_emerged_is_idempotent_on_seq_no() {
        let mut avg = averager();
        avg.add_emerged(1);
        avg.add_emerged(1);
        assert_eq!(avg.iter_slots().count(), 1);
    }

    #[test]
    fn emerged_then_transcoded_resolves_successfully() {
        let mut avg = averager();
        avg.add_emerged(1);
        avg.add_transcoded(1, false);
        let (rate, had_any) = avg.success_rate();
        assert!(had_any);
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn ring_keeps_only_capacity_most_recent_slots() {
        let mut avg = averager();
        for seq in 1..=5u64 {
            avg.add_emerged(seq);
            avg.add_transcoded(seq, false);
        }
        assert_eq!(avg.iter_slots().count(), 3);
        let seqs: Vec<SeqNo> = avg.iter_slots().map(|s| s.seq_no).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn unresolved_segment_within_grace_is_not_counted() {
        let mut avg = averager();
        avg.add_emerged(1);
        let (_, had_any) = avg.success_rate();
        assert!(!had_any);
    }

    #[test]
    fn unresolved_segment_past_grace_counts_as_failed() {
        let mut avg = SegmentsAverager::new(3, Duration::from_millis(1));
        avg.add_emerged(1);
        std::thread::sleep(Duration::from_millis(5));
        let (rate, had_any) = avg.success_rate();
        assert!(had_any);
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn empty_averager_can_be_removed() {
        let avg = averager();
        assert!(avg.can_be_removed());
    }

    #[test]
    fn averager_with_unresolved_slot_cannot_be_removed() {
        let mut avg = averager();
        avg.add_emerged(1);
        assert!(!avg.can_be_removed());
    }

    #[test]
    fn should_reap_after_grace_period_since_removal() {
        let mut avg = averager();
        avg.mark_removed();
        assert!(!avg.should_reap());
    }
}
