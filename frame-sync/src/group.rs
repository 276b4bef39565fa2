//! A group of contemporaneous frames awaiting cameras.
use mcmot_common::{CameraId, SyncKey};
use std::{collections::BTreeSet, time::Duration, time::Instant};

/// Holds the frames collected so far for one sync key, while the group
/// waits in the engine for the remaining cameras.
pub(crate) struct PendingGroup<P> {
    pub(crate) sync_key: SyncKey,
    /// Instant past which the group may be emitted incomplete.
    expiry: Instant,
    complete: bool,
    frames: Vec<(CameraId, P)>,
}

impl<P> PendingGroup<P> {
    pub(crate) fn new(sync_key: SyncKey, ttl: Duration) -> Self {
        Self {
            sync_key,
            expiry: Instant::now() + ttl,
            complete: false,
            frames: Vec::new(),
        }
    }

    pub(crate) fn has_camera(&self, camera_id: &str) -> bool {
        self.frames.iter().any(|(id, _)| id == camera_id)
    }

    pub(crate) fn push(&mut self, camera_id: CameraId, payload: P) {
        self.frames.push((camera_id, payload));
    }

    /// Ordered, non-repeating list of cameras collected so far.
    pub(crate) fn cameras(&self) -> Vec<CameraId> {
        let mut cameras: Vec<CameraId> = self.frames.iter().map(|(id, _)| id.clone()).collect();
        cameras.sort();
        cameras
    }

    /// Marks the group complete once every camera of the epoch has
    /// contributed a frame.
    pub(crate) fn set_completion_status(&mut self, epoch: &BTreeSet<CameraId>) {
        if !epoch.is_empty() && self.cameras().iter().eq(epoch.iter()) {
            self.complete = true;
        }
    }

    pub(crate) fn force_complete(&mut self) {
        self.complete = true;
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() > self.expiry
    }

    pub(crate) fn into_frames(self) -> Vec<(CameraId, P)> {
        let mut frames = self.frames;
        frames.sort_by(|(a, _), (b, _)| a.cmp(b));
        frames
    }

    /// Cameras of the epoch this group is still waiting for.
    pub(crate) fn missing_cameras(&self, epoch: &BTreeSet<CameraId>) -> Vec<CameraId> {
        epoch
            .iter()
            .filter(|camera| !self.has_camera(camera))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(cameras: &[&str]) -> BTreeSet<CameraId> {
        cameras.iter().map(|c| (*c).to_owned()).collect()
    }

    #[test]
    fn group_completes_only_with_every_epoch_camera() {
        let mut group = PendingGroup::new(7, Duration::from_secs(5));
        let epoch = epoch(&["a", "b"]);

        group.push("a".to_owned(), ());
        group.set_completion_status(&epoch);
        assert!(!group.is_complete());
        assert_eq!(group.missing_cameras(&epoch), vec!["b".to_owned()]);

        group.push("b".to_owned(), ());
        group.set_completion_status(&epoch);
        assert!(group.is_complete());
    }

    #[test]
    fn expiry_follows_the_ttl() {
        let group = PendingGroup::<()>::new(0, Duration::from_millis(20));
        assert!(!group.is_expired());
        std::thread::sleep(Duration::from_millis(25));
        assert!(group.is_expired());
    }

    #[test]
    fn frames_come_out_ordered_by_camera() {
        let mut group = PendingGroup::new(0, Duration::from_secs(1));
        group.push("b".to_owned(), 2);
        group.push("a".to_owned(), 1);
        assert_eq!(
            group.into_frames(),
            vec![("a".to_owned(), 1), ("b".to_owned(), 2)]
        );
    }
}
