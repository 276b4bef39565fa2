//! The synchronisation engine proper.
use crate::{
    config::{SyncConfig, SyncType},
    group::PendingGroup,
    watermark::CameraWatermark,
};
use mcmot_common::{CameraId, FrameNumber, SyncKey};
use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap, HashMap, VecDeque},
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Per-camera reorder buffers hold at most this many frames before the
/// smallest key is flushed through.
const SEQUENCER_CAPACITY: usize = 8;

/// Why a frame was not admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Key at or below the camera watermark.
    Duplicate,
    /// Arrived later than `latency_threshold` past its expected time.
    Stale,
}

/// The intra-camera admission verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDecision {
    Accept,
    Skip(SkipReason),
    Wait(Duration),
}

/// A group of contemporaneous frames released by the engine. Frames are
/// ordered by camera id.
#[derive(Debug)]
pub struct SyncGroup<P> {
    pub sync_key: SyncKey,
    /// `true` when every camera of the epoch contributed a frame.
    pub complete: bool,
    pub frames: Vec<(CameraId, P)>,
}

struct SequencedFrame<P> {
    key: SyncKey,
    camera_id: CameraId,
    payload: P,
}

impl<P> PartialEq for SequencedFrame<P> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<P> Eq for SequencedFrame<P> {}

impl<P> PartialOrd for SequencedFrame<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for SequencedFrame<P> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

struct SyncState<P> {
    watermarks: HashMap<CameraId, CameraWatermark>,
    /// Cameras observed since startup; the completeness reference set.
    epoch: BTreeSet<CameraId>,
    /// Pending groups, ordered by ascending sync key.
    groups: VecDeque<PendingGroup<P>>,
    /// Groups squeezed out by backlog pressure, awaiting pickup by `poll`.
    overflow: VecDeque<PendingGroup<P>>,
    /// Sync key of the last emitted or discarded group; older deposits are
    /// dropped.
    global_watermark: Option<SyncKey>,
    sequencers: HashMap<CameraId, BinaryHeap<Reverse<SequencedFrame<P>>>>,
    last_backlog_check: Instant,
    emitted_any: bool,
}

/// Frame synchroniser; see the crate docs for the two modes of use.
///
/// All state is guarded by one mutex. No callback is ever invoked under
/// the lock: [FrameSync::poll] returns owned groups for the caller to act
/// on.
pub struct FrameSync<P> {
    config: SyncConfig,
    state: Mutex<SyncState<P>>,
}

impl<P> FrameSync<P> {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SyncState {
                watermarks: HashMap::new(),
                epoch: BTreeSet::new(),
                groups: VecDeque::new(),
                overflow: VecDeque::new(),
                global_watermark: None,
                sequencers: HashMap::new(),
                last_backlog_check: Instant::now(),
                emitted_any: false,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Intra-camera admission: decide whether the incoming frame should be
    /// processed now, dropped, or delayed.
    ///
    /// The decision is a pure function of the camera watermark, the
    /// incoming key and the wall clock (see [decide]); this method only
    /// adds the watermark bookkeeping around it.
    pub fn skip_or_wait(
        &self,
        camera_id: &str,
        frame_number: FrameNumber,
        frame_timestamp: f64,
        fps: u32,
    ) -> SyncDecision {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if self.config.sync_type == SyncType::None {
            return SyncDecision::Accept;
        }

        let key = self.config.sync_key(frame_number, frame_timestamp, fps);
        let mut decision = decide(
            state.watermarks.get(camera_id),
            key,
            now,
            self.config.period(fps),
            self.config.tol(fps),
            self.config.latency_threshold,
        );

        if self.config.seek_to_end && matches!(decision, SyncDecision::Wait(_) | SyncDecision::Skip(SkipReason::Stale)) {
            decision = SyncDecision::Accept;
        }

        if self.config.ignore_initial_delay
            && !state.emitted_any
            && matches!(decision, SyncDecision::Wait(_))
        {
            decision = SyncDecision::Accept;
        }

        if decision == SyncDecision::Accept {
            state.watermarks.insert(
                camera_id.to_owned(),
                CameraWatermark::new(key, frame_number, frame_timestamp, now),
            );
        }

        decision
    }

    /// Inter-camera collection: file the frame under its sync key and keep
    /// it until the group is released by [FrameSync::poll].
    pub fn deposit(
        &self,
        camera_id: &str,
        frame_number: FrameNumber,
        frame_timestamp: f64,
        fps: u32,
        payload: P,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch.insert(camera_id.to_owned());

        let key = self.config.sync_key(frame_number, frame_timestamp, fps);

        if self.config.enable_sequencing && !self.config.seek_to_end {
            let sequencer = state.sequencers.entry(camera_id.to_owned()).or_default();
            sequencer.push(Reverse(SequencedFrame {
                key,
                camera_id: camera_id.to_owned(),
                payload,
            }));
            while state
                .sequencers
                .get(camera_id)
                .is_some_and(|heap| heap.len() > SEQUENCER_CAPACITY)
            {
                if let Some(Reverse(frame)) = state
                    .sequencers
                    .get_mut(camera_id)
                    .and_then(BinaryHeap::pop)
                {
                    self.deposit_inner(&mut state, frame.key, frame.camera_id, frame.payload);
                }
            }
        } else {
            self.deposit_inner(&mut state, key, camera_id.to_owned(), payload);
        }

        self.enforce_backlog(&mut state);
    }

    fn deposit_inner(
        &self,
        state: &mut SyncState<P>,
        key: SyncKey,
        camera_id: CameraId,
        payload: P,
    ) {
        if self.config.seek_to_end {
            if !state.groups.is_empty() {
                debug!(
                    discarded = state.groups.len(),
                    "seek-to-end discarding in-flight groups"
                );
            }
            state.groups.clear();
            state.overflow.clear();
            let mut group = PendingGroup::new(key, self.retention());
            group.push(camera_id, payload);
            group.force_complete();
            state.groups.push_back(group);
            return;
        }

        if let Some(watermark) = state.global_watermark {
            if key <= watermark {
                debug!(key, watermark, %camera_id, "dropping frame behind the global watermark");
                return;
            }
        }

        let position = state.groups.iter().position(|group| group.sync_key >= key);
        if let Some(group) = position
            .and_then(|index| state.groups.get_mut(index))
            .filter(|group| group.sync_key == key)
        {
            if group.has_camera(&camera_id) {
                warn!(key, %camera_id, "group already has a frame from this camera");
                return;
            }
            group.push(camera_id, payload);
            group.set_completion_status(&state.epoch);
        } else {
            let index = position.unwrap_or(state.groups.len());
            let mut group = PendingGroup::new(key, self.retention());
            group.push(camera_id, payload);
            group.set_completion_status(&state.epoch);
            state.groups.insert(index, group);
        }
    }

    /// Releases the next ready group, if any: a backlog victim first, then
    /// the oldest pending group once complete or expired.
    pub fn poll(&self) -> Option<SyncGroup<P>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if now.duration_since(state.last_backlog_check).as_secs_f64()
            >= self.config.backlog_check_interval
        {
            state.last_backlog_check = now;
            self.drain_sequencers(&mut state);
            self.enforce_backlog(&mut state);
        }

        if let Some(group) = state.overflow.pop_front() {
            return Some(Self::release(&mut state, group));
        }

        if state
            .groups
            .front()
            .is_some_and(|group| group.is_complete() || group.is_expired())
        {
            let group = state.groups.pop_front()?;
            if !group.is_complete() {
                debug!(
                    key = group.sync_key,
                    missing = ?group.missing_cameras(&state.epoch),
                    "retention expired, emitting partial group"
                );
            }
            return Some(Self::release(&mut state, group));
        }

        None
    }

    fn release(state: &mut SyncState<P>, group: PendingGroup<P>) -> SyncGroup<P> {
        let key = group.sync_key;
        state.global_watermark = Some(state.global_watermark.map_or(key, |w| w.max(key)));
        state.emitted_any = true;
        let complete = group.missing_cameras(&state.epoch).is_empty();
        SyncGroup {
            sync_key: key,
            complete,
            frames: group.into_frames(),
        }
    }

    /// Backlog bound: pending groups beyond `backlog_threshold` are forced
    /// out oldest-first, discarded in unify mode, queued for emission as
    /// incomplete otherwise.
    fn enforce_backlog(&self, state: &mut SyncState<P>) {
        while state.groups.len() > self.config.backlog_threshold {
            let Some(group) = state.groups.pop_front() else {
                return;
            };
            state.global_watermark =
                Some(state.global_watermark.map_or(group.sync_key, |w| w.max(group.sync_key)));
            if self.config.unify {
                warn!(
                    key = group.sync_key,
                    cameras = ?group.cameras(),
                    backlog_threshold = self.config.backlog_threshold,
                    "backlog exceeded, discarding oldest group"
                );
            } else {
                warn!(
                    key = group.sync_key,
                    backlog_threshold = self.config.backlog_threshold,
                    "backlog exceeded, emitting oldest group incomplete"
                );
                state.overflow.push_back(group);
            }
        }
    }

    fn drain_sequencers(&self, state: &mut SyncState<P>) {
        let mut drained: Vec<SequencedFrame<P>> = Vec::new();
        for (_, sequencer) in state.sequencers.iter_mut() {
            while let Some(Reverse(frame)) = sequencer.pop() {
                drained.push(frame);
            }
        }
        drained.sort_by_key(|frame| frame.key);
        for frame in drained {
            self.deposit_inner(state, frame.key, frame.camera_id, frame.payload);
        }
    }

    fn retention(&self) -> Duration {
        Duration::from_secs_f64(self.config.retention_time.max(0.0))
    }

    /// Number of groups currently buffered.
    pub fn pending_groups(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.groups.len() + state.overflow.len()
    }

    /// Cameras observed so far in this epoch.
    pub fn epoch_cameras(&self) -> Vec<CameraId> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.epoch.iter().cloned().collect()
    }
}

/// The admission decision as a pure function of watermark, incoming key
/// and wall clock. Identical inputs always yield identical outputs.
fn decide(
    watermark: Option<&CameraWatermark>,
    key: SyncKey,
    now: Instant,
    period: f64,
    tol: f64,
    latency_threshold: f64,
) -> SyncDecision {
    let Some(watermark) = watermark else {
        return SyncDecision::Accept;
    };

    if key <= watermark.key {
        return SyncDecision::Skip(SkipReason::Duplicate);
    }

    let ahead = (key - watermark.key) as f64 * period;
    let expected = watermark.arrival + Duration::from_secs_f64(ahead);

    if now >= expected {
        if now.duration_since(expected).as_secs_f64() > latency_threshold {
            SyncDecision::Skip(SkipReason::Stale)
        } else {
            SyncDecision::Accept
        }
    } else {
        let early = expected.duration_since(now);
        if early.as_secs_f64() > tol {
            SyncDecision::Wait(early)
        } else {
            SyncDecision::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unify_config(fps: u32, retention_time: f64) -> SyncConfig {
        SyncConfig {
            sync_type: SyncType::Timestamp,
            fps,
            retention_time,
            backlog_check_interval: 0.0,
            unify: true,
            ..Default::default()
        }
    }

    mod decide {
        use super::*;

        const PERIOD: f64 = 1.0 / 30.0;
        const LATENCY_THRESHOLD: f64 = 0.5;

        fn watermark_at(key: SyncKey, arrival: Instant) -> CameraWatermark {
            CameraWatermark::new(key, key as u64, key as f64 * PERIOD, arrival)
        }

        #[test]
        fn first_frame_is_accepted() {
            assert_eq!(
                decide(None, 0, Instant::now(), PERIOD, 1.0, LATENCY_THRESHOLD),
                SyncDecision::Accept
            );
        }

        #[test]
        fn frame_at_or_below_watermark_is_skipped() {
            let now = Instant::now();
            let watermark = watermark_at(100, now);
            assert_eq!(
                decide(Some(&watermark), 95, now, PERIOD, 1.0, LATENCY_THRESHOLD),
                SyncDecision::Skip(SkipReason::Duplicate)
            );
            assert_eq!(
                decide(Some(&watermark), 100, now, PERIOD, 1.0, LATENCY_THRESHOLD),
                SyncDecision::Skip(SkipReason::Duplicate)
            );
        }

        #[test]
        fn on_time_frame_is_accepted() {
            let arrival = Instant::now();
            let watermark = watermark_at(100, arrival);
            let now = arrival + Duration::from_secs_f64(PERIOD);
            assert_eq!(
                decide(Some(&watermark), 101, now, PERIOD, 1.0, LATENCY_THRESHOLD),
                SyncDecision::Accept
            );
        }

        #[test]
        fn frame_later_than_latency_threshold_is_skipped() {
            let arrival = Instant::now();
            let watermark = watermark_at(100, arrival);
            let now = arrival + Duration::from_secs_f64(PERIOD + 2.0 * LATENCY_THRESHOLD);
            assert_eq!(
                decide(Some(&watermark), 101, now, PERIOD, 1.0, LATENCY_THRESHOLD),
                SyncDecision::Skip(SkipReason::Stale)
            );
        }

        #[test]
        fn frame_ahead_of_schedule_waits() {
            let arrival = Instant::now();
            let watermark = watermark_at(100, arrival);
            // Frame 160 is two seconds ahead at 30 fps.
            let decision = decide(Some(&watermark), 160, arrival, PERIOD, 1.0, LATENCY_THRESHOLD);
            assert!(
                matches!(decision, SyncDecision::Wait(duration) if duration.as_secs_f64() > 1.0),
                "expected Wait, got {decision:?}"
            );
        }

        #[test]
        fn identical_inputs_yield_identical_outputs() {
            let arrival = Instant::now();
            let watermark = watermark_at(10, arrival);
            let now = arrival + Duration::from_secs_f64(5.0 * PERIOD);
            let first = decide(Some(&watermark), 15, now, PERIOD, 1.0, LATENCY_THRESHOLD);
            let second = decide(Some(&watermark), 15, now, PERIOD, 1.0, LATENCY_THRESHOLD);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn two_offset_cameras_group_per_bucket() {
        // Camera A at exact multiples of 1/30, camera B five milliseconds
        // behind: every bucket must contain exactly both.
        let sync = FrameSync::new(unify_config(30, 5.0));
        for k in 0..5u64 {
            let t = k as f64 / 30.0;
            sync.deposit("cam-a", k, t, 30, format!("a{k}"));
            sync.deposit("cam-b", k, t + 0.005, 30, format!("b{k}"));
        }

        for k in 0..5i64 {
            let group = sync.poll().expect("group should be ready");
            assert_eq!(group.sync_key, k);
            assert!(group.complete);
            let cameras: Vec<_> = group.frames.iter().map(|(id, _)| id.clone()).collect();
            assert_eq!(cameras, vec!["cam-a".to_owned(), "cam-b".to_owned()]);
        }
        assert!(sync.poll().is_none());
    }

    #[tokio::test]
    async fn retention_expiry_emits_partial_groups() {
        let sync = FrameSync::new(unify_config(30, 0.05));

        // Both cameras seen once, so the epoch is {a, b}.
        sync.deposit("cam-a", 0, 0.0, 30, "a0");
        sync.deposit("cam-b", 0, 0.0, 30, "b0");
        assert!(sync.poll().expect("complete group").complete);

        // Camera B stops; A keeps producing.
        sync.deposit("cam-a", 1, 1.0 / 30.0, 30, "a1");
        assert!(sync.poll().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let group = sync.poll().expect("expired group should be emitted");
        assert_eq!(group.sync_key, 1);
        assert!(!group.complete);
        assert_eq!(group.frames.len(), 1);
    }

    #[test]
    fn backlog_discards_oldest_groups_in_unify_mode() {
        let config = SyncConfig {
            backlog_threshold: 3,
            ..unify_config(30, 60.0)
        };
        let sync = FrameSync::new(config);

        // Establish a two-camera epoch, then let B lag for ten buckets.
        sync.deposit("cam-a", 0, 0.0, 30, "a0");
        sync.deposit("cam-b", 0, 0.0, 30, "b0");
        sync.poll().expect("first group");

        for k in 1..=10u64 {
            sync.deposit("cam-a", k, k as f64 / 30.0, 30, format!("a{k}"));
            assert!(sync.pending_groups() <= 3);
        }

        // Only the three newest buckets survive; none is complete.
        assert_eq!(sync.pending_groups(), 3);
        assert!(sync.poll().is_none());
    }

    #[test]
    fn backlog_emits_incomplete_groups_when_not_unifying() {
        let config = SyncConfig {
            backlog_threshold: 2,
            unify: false,
            ..unify_config(30, 60.0)
        };
        let sync = FrameSync::new(config);

        sync.deposit("cam-b", 0, 0.0, 30, "b0");
        for k in 1..=5u64 {
            sync.deposit("cam-a", k, k as f64 / 30.0, 30, format!("a{k}"));
        }

        // Three groups were squeezed out and are handed back oldest-first.
        let released = sync.poll().expect("overflow group");
        assert_eq!(released.sync_key, 0);
        assert!(sync.poll().is_some());
        assert!(sync.poll().is_some());
    }

    #[test]
    fn deposits_behind_the_global_watermark_are_dropped() {
        let sync = FrameSync::new(unify_config(30, 60.0));
        sync.deposit("cam-a", 5, 5.0 / 30.0, 30, "a5");
        sync.poll().expect("single-camera epoch completes");

        sync.deposit("cam-a", 3, 3.0 / 30.0, 30, "late");
        assert_eq!(sync.pending_groups(), 0);
    }

    #[test]
    fn sequencing_reorders_out_of_order_arrivals() {
        let config = SyncConfig {
            enable_sequencing: true,
            ..unify_config(30, 60.0)
        };
        let sync = FrameSync::new(config);

        for k in [5u64, 3, 4] {
            sync.deposit("cam-a", k, k as f64 / 30.0, 30, k);
        }
        // Frames are still in the reorder buffer.
        assert_eq!(sync.pending_groups(), 0);

        // The first poll past the check interval drains the sequencers in
        // ascending key order.
        let group = sync.poll().expect("drained group");
        assert_eq!(group.sync_key, 3);
        assert_eq!(sync.poll().expect("next").sync_key, 4);
        assert_eq!(sync.poll().expect("next").sync_key, 5);
    }

    #[test]
    fn seek_to_end_keeps_only_the_latest_frame() {
        let config = SyncConfig {
            seek_to_end: true,
            ..unify_config(30, 60.0)
        };
        let sync = FrameSync::new(config);

        for k in 1..=5u64 {
            sync.deposit("cam-a", k, k as f64 / 30.0, 30, k);
        }
        assert_eq!(sync.pending_groups(), 1);
        assert_eq!(sync.poll().expect("latest").sync_key, 5);
        assert!(sync.poll().is_none());
    }

    #[test]
    fn ignore_initial_delay_suppresses_the_first_waits() {
        let config = SyncConfig {
            sync_type: SyncType::Timestamp,
            fps: 30,
            ignore_initial_delay: true,
            latency_threshold: 10.0,
            ..Default::default()
        };
        let sync = FrameSync::new(config);

        assert_eq!(sync.skip_or_wait("cam-a", 0, 0.0, 30), SyncDecision::Accept);
        // Frame 60 is two seconds ahead of schedule but accepted during
        // warm-up.
        assert_eq!(
            sync.skip_or_wait("cam-a", 60, 2.0, 30),
            SyncDecision::Accept
        );

        // After a first emission the wait phase applies again.
        sync.deposit("cam-a", 61, 61.0 / 30.0, 30, ());
        sync.poll().expect("group");
        assert!(matches!(
            sync.skip_or_wait("cam-a", 120, 4.0, 30),
            SyncDecision::Wait(_)
        ));
    }

    #[test]
    fn sync_type_none_accepts_everything() {
        let sync = FrameSync::<()>::new(SyncConfig::default());
        assert_eq!(sync.skip_or_wait("cam-a", 5, 0.1, 30), SyncDecision::Accept);
        assert_eq!(sync.skip_or_wait("cam-a", 5, 0.1, 30), SyncDecision::Accept);
        assert_eq!(sync.skip_or_wait("cam-a", 2, 0.0, 30), SyncDecision::Accept);
    }

    #[tokio::test]
    async fn buffer_is_empty_after_quiescence_beyond_retention() {
        let sync = FrameSync::new(unify_config(30, 0.03));
        sync.deposit("cam-a", 0, 0.0, 30, "a0");
        sync.deposit("cam-b", 0, 0.0, 30, "b0");
        sync.poll().expect("complete group");
        sync.deposit("cam-a", 1, 1.0 / 30.0, 30, "a1");
        sync.deposit("cam-a", 2, 2.0 / 30.0, 30, "a2");

        tokio::time::sleep(Duration::from_millis(50)).await;
        while sync.poll().is_some() {}
        assert_eq!(sync.pending_groups(), 0);
    }
}
