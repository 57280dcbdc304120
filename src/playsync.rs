//! Play synchronization across overlapping activities.
//!
//! Activities that belong together (a spoken prompt, the song it announces,
//! the card shown for both) are grouped by dialog request id or play service
//! id. Each object moves through `prepare_sync` → `start_sync` →
//! `release_sync`; when a member leaves gracefully and exactly one member of
//! its group is left, that last member is asked to release. An immediate
//! release asks every remaining member at once.
//!
//! The synchronizer only keeps weak references. Callbacks run after the lock
//! is dropped, and a panicking callback cannot corrupt the bookkeeping.

use crate::executor::{lock, Scheduler, TimerHandle};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, warn};

pub trait SynchronizeObject: Send + Sync {
    fn dialog_request_id(&self) -> String;

    fn play_service_id(&self) -> Option<String> {
        None
    }

    /// The synchronizer decided this object's activity is over. `immediate`
    /// is set when a partner was stopped outright rather than finishing.
    fn request_release_sync(&self, immediate: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Prepared,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    Granted,
    Denied,
}

type ObjectKey = usize;

fn key_of(object: &Arc<dyn SynchronizeObject>) -> ObjectKey {
    Arc::as_ptr(object) as *const () as usize
}

struct Entry {
    key: ObjectKey,
    object: Weak<dyn SynchronizeObject>,
    dialog_request_id: String,
    play_service_id: Option<String>,
    state: SyncState,
    release_requested: bool,
    deferred: Option<TimerHandle>,
}

impl Entry {
    fn related(&self, dialog_request_id: &str, play_service_id: Option<&str>) -> bool {
        if self.dialog_request_id == dialog_request_id {
            return true;
        }
        match (self.play_service_id.as_deref(), play_service_id) {
            (Some(a), Some(b)) => !a.is_empty() && a == b,
            _ => false,
        }
    }

    fn is_active(&self) -> bool {
        self.deferred.is_none() && self.object.strong_count() > 0
    }
}

type Request = (ObjectKey, Weak<dyn SynchronizeObject>, bool);

pub struct PlaySynchronizer {
    entries: Mutex<Vec<Entry>>,
    scheduler: Arc<Scheduler>,
    this: Weak<PlaySynchronizer>,
}

impl PlaySynchronizer {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: Mutex::new(Vec::new()),
            scheduler,
            this: this.clone(),
        })
    }

    /// Reserves `object`. A no-op when it is already tracked.
    pub fn prepare_sync(&self, object: &Arc<dyn SynchronizeObject>) {
        let key = key_of(object);
        let dialog_request_id = object.dialog_request_id();
        let play_service_id = object.play_service_id();
        let flushed = {
            let mut entries = lock(&self.entries);
            entries.retain(|e| e.object.strong_count() > 0);
            if entries.iter().any(|e| e.key == key) {
                return;
            }
            debug!(dialog_request_id = dialog_request_id.as_str(), "sync prepared");
            let flushed =
                Self::take_unrelated_deferred(&mut entries, &dialog_request_id, play_service_id.as_deref());
            entries.push(Entry {
                key,
                object: Arc::downgrade(object),
                dialog_request_id,
                play_service_id,
                state: SyncState::Prepared,
                release_requested: false,
                deferred: None,
            });
            flushed
        };
        self.flush(flushed);
    }

    /// Promotes a prepared object. Denied when the object was never prepared,
    /// has been released, or is already on its way out.
    pub fn start_sync(&self, object: &Arc<dyn SynchronizeObject>) -> SyncResult {
        let key = key_of(object);
        let (result, flushed) = {
            let mut entries = lock(&self.entries);
            let entry = match entries.iter_mut().find(|e| e.key == key) {
                Some(entry) if entry.deferred.is_none() => entry,
                _ => return SyncResult::Denied,
            };
            entry.state = SyncState::Started;
            let dialog_request_id = entry.dialog_request_id.clone();
            let play_service_id = entry.play_service_id.clone();
            debug!(dialog_request_id = dialog_request_id.as_str(), "sync started");
            let flushed = Self::take_unrelated_deferred(
                &mut entries,
                &dialog_request_id,
                play_service_id.as_deref(),
            );
            (SyncResult::Granted, flushed)
        };
        self.flush(flushed);
        result
    }

    /// Releases `object`, optionally after a grace period.
    pub fn release_sync(&self, object: &Arc<dyn SynchronizeObject>, delay: Option<Duration>) {
        let key = key_of(object);
        let delay = match delay {
            Some(delay) if !delay.is_zero() => delay,
            _ => return self.release_key(key, false),
        };

        let mut entries = lock(&self.entries);
        let entry = match entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry,
            None => return,
        };
        if entry.deferred.is_some() {
            return;
        }
        debug!(
            dialog_request_id = entry.dialog_request_id.as_str(),
            ?delay,
            "sync release deferred"
        );
        let this = self.this.clone();
        entry.deferred = Some(self.scheduler.schedule(delay, move || {
            if let Some(this) = this.upgrade() {
                this.release_key(key, false);
            }
        }));
    }

    /// Releases `object` now and asks every other member of its group to
    /// release as well.
    pub fn release_sync_immediately(&self, object: &Arc<dyn SynchronizeObject>) {
        self.release_key(key_of(object), true);
    }

    /// Whether another member of `object`'s group is prepared or started.
    pub fn exist_other_sync_object(&self, object: &Arc<dyn SynchronizeObject>) -> bool {
        let key = key_of(object);
        let dialog_request_id = object.dialog_request_id();
        let play_service_id = object.play_service_id();
        lock(&self.entries).iter().any(|e| {
            e.key != key
                && e.is_active()
                && e.related(&dialog_request_id, play_service_id.as_deref())
        })
    }

    pub fn state_of(&self, object: &Arc<dyn SynchronizeObject>) -> Option<SyncState> {
        let key = key_of(object);
        lock(&self.entries)
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.state)
    }

    pub fn is_tracked(&self, object: &Arc<dyn SynchronizeObject>) -> bool {
        self.state_of(object).is_some()
    }

    pub fn tracked_count(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.object.strong_count() > 0)
            .count()
    }

    fn release_key(&self, key: ObjectKey, immediate: bool) {
        let requests = {
            let mut entries = lock(&self.entries);
            let position = match entries.iter().position(|e| e.key == key) {
                Some(position) => position,
                None => return,
            };
            let released = entries.remove(position);
            if let Some(timer) = &released.deferred {
                timer.cancel();
            }
            debug!(
                dialog_request_id = released.dialog_request_id.as_str(),
                immediate, "sync released"
            );
            entries.retain(|e| e.object.strong_count() > 0);

            let mut members: Vec<&mut Entry> = entries
                .iter_mut()
                .filter(|e| {
                    e.related(&released.dialog_request_id, released.play_service_id.as_deref())
                })
                .collect();
            if !immediate && members.len() != 1 {
                members.clear();
            }
            members
                .into_iter()
                .filter(|e| !e.release_requested)
                .map(|e| {
                    e.release_requested = true;
                    (e.key, e.object.clone(), immediate)
                })
                .collect::<Vec<Request>>()
        };
        self.deliver(requests);
    }

    fn take_unrelated_deferred(
        entries: &mut [Entry],
        dialog_request_id: &str,
        play_service_id: Option<&str>,
    ) -> Vec<ObjectKey> {
        entries
            .iter_mut()
            .filter(|e| e.deferred.is_some() && !e.related(dialog_request_id, play_service_id))
            .map(|e| {
                if let Some(timer) = e.deferred.take() {
                    timer.cancel();
                }
                e.key
            })
            .collect()
    }

    fn flush(&self, keys: Vec<ObjectKey>) {
        for key in keys {
            debug!("newer activity claims the release grace period");
            self.release_key(key, false);
        }
    }

    fn deliver(&self, requests: Vec<Request>) {
        for (key, object, immediate) in requests {
            let object = match object.upgrade() {
                Some(object) => object,
                None => continue,
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| object.request_release_sync(immediate)));
            if outcome.is_err() {
                warn!("release callback panicked; dropping the object from play sync");
                lock(&self.entries).retain(|e| e.key != key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct TestObject {
        dialog: String,
        service: Option<String>,
        requests: Mutex<Vec<bool>>,
        explode: bool,
    }

    impl TestObject {
        fn new(dialog: &str) -> Arc<TestObject> {
            Self::build(dialog, None, false)
        }

        fn build(dialog: &str, service: Option<&str>, explode: bool) -> Arc<TestObject> {
            Arc::new(TestObject {
                dialog: dialog.to_string(),
                service: service.map(str::to_string),
                requests: Mutex::new(Vec::new()),
                explode,
            })
        }

        fn requests(&self) -> Vec<bool> {
            lock(&self.requests).clone()
        }
    }

    impl SynchronizeObject for TestObject {
        fn dialog_request_id(&self) -> String {
            self.dialog.clone()
        }

        fn play_service_id(&self) -> Option<String> {
            self.service.clone()
        }

        fn request_release_sync(&self, immediate: bool) {
            lock(&self.requests).push(immediate);
            if self.explode {
                panic!("release callback failure");
            }
        }
    }

    fn as_dyn(object: &Arc<TestObject>) -> Arc<dyn SynchronizeObject> {
        object.clone()
    }

    fn synchronizer() -> Arc<PlaySynchronizer> {
        PlaySynchronizer::new(Arc::new(Scheduler::new("test-playsync").unwrap()))
    }

    #[test]
    fn test_start_requires_prepare() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::new("d1"));
        assert_eq!(sync.start_sync(&tts), SyncResult::Denied);
        sync.prepare_sync(&tts);
        assert_eq!(sync.state_of(&tts), Some(SyncState::Prepared));
        assert_eq!(sync.start_sync(&tts), SyncResult::Granted);
        assert_eq!(sync.state_of(&tts), Some(SyncState::Started));
    }

    #[test]
    fn test_release_before_start_denies_start() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::new("d1"));
        sync.prepare_sync(&tts);
        sync.release_sync(&tts, None);
        assert_eq!(sync.start_sync(&tts), SyncResult::Denied);
        assert!(!sync.is_tracked(&tts));
    }

    #[test]
    fn test_last_member_is_asked_to_release_once() {
        let sync = synchronizer();
        let tts = TestObject::new("d1");
        let card = TestObject::new("d1");
        let (tts_dyn, card_dyn) = (as_dyn(&tts), as_dyn(&card));
        sync.prepare_sync(&tts_dyn);
        sync.prepare_sync(&card_dyn);
        sync.start_sync(&tts_dyn);
        sync.start_sync(&card_dyn);
        assert!(sync.exist_other_sync_object(&card_dyn));

        sync.release_sync(&tts_dyn, None);
        assert_eq!(card.requests(), vec![false]);
        assert!(!sync.exist_other_sync_object(&card_dyn));
        // Still tracked and started until it releases itself.
        assert_eq!(sync.state_of(&card_dyn), Some(SyncState::Started));

        sync.release_sync(&tts_dyn, None);
        assert_eq!(card.requests(), vec![false]);
        sync.release_sync(&card_dyn, None);
        assert_eq!(sync.tracked_count(), 0);
        assert!(tts.requests().is_empty());
    }

    #[test]
    fn test_no_request_while_other_members_remain() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::new("d1"));
        let music = TestObject::new("d1");
        let card = TestObject::new("d1");
        let (music_dyn, card_dyn) = (as_dyn(&music), as_dyn(&card));
        for object in [&tts, &music_dyn, &card_dyn] {
            sync.prepare_sync(object);
            sync.start_sync(object);
        }
        sync.release_sync(&tts, None);
        assert!(music.requests().is_empty());
        assert!(card.requests().is_empty());

        sync.release_sync(&music_dyn, None);
        assert_eq!(card.requests(), vec![false]);
    }

    #[test]
    fn test_immediate_release_asks_everyone() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::new("d1"));
        let music = TestObject::new("d1");
        let card = TestObject::new("d1");
        let other_turn = TestObject::new("d2");
        for object in [&tts, &as_dyn(&music), &as_dyn(&card), &as_dyn(&other_turn)] {
            sync.prepare_sync(object);
        }
        sync.release_sync_immediately(&tts);
        assert_eq!(music.requests(), vec![true]);
        assert_eq!(card.requests(), vec![true]);
        assert!(other_turn.requests().is_empty());
    }

    #[test]
    fn test_play_service_id_groups_across_turns() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::build("d1", Some("music"), false));
        let player = TestObject::build("d2", Some("music"), false);
        let player_dyn = as_dyn(&player);
        sync.prepare_sync(&tts);
        sync.prepare_sync(&player_dyn);
        assert!(sync.exist_other_sync_object(&player_dyn));
        sync.release_sync(&tts, None);
        assert_eq!(player.requests(), vec![false]);
    }

    #[test]
    fn test_deferred_release_happens_after_delay() {
        let sync = synchronizer();
        let player = as_dyn(&TestObject::new("d1"));
        let card = TestObject::new("d1");
        let card_dyn = as_dyn(&card);
        sync.prepare_sync(&player);
        sync.prepare_sync(&card_dyn);
        sync.release_sync(&player, Some(Duration::from_millis(40)));
        assert!(sync.is_tracked(&player));
        assert!(!sync.exist_other_sync_object(&card_dyn));
        assert_eq!(sync.start_sync(&player), SyncResult::Denied);
        thread::sleep(Duration::from_millis(120));
        assert!(!sync.is_tracked(&player));
        assert_eq!(card.requests(), vec![false]);
    }

    #[test]
    fn test_unrelated_activity_claims_grace_period() {
        let sync = synchronizer();
        let player = as_dyn(&TestObject::new("d1"));
        let card = TestObject::new("d1");
        sync.prepare_sync(&player);
        sync.prepare_sync(&as_dyn(&card));
        sync.release_sync(&player, Some(Duration::from_secs(30)));

        let same_turn = as_dyn(&TestObject::new("d1"));
        sync.prepare_sync(&same_turn);
        assert!(sync.is_tracked(&player));

        let next_turn = as_dyn(&TestObject::new("d2"));
        sync.prepare_sync(&next_turn);
        assert!(!sync.is_tracked(&player));
    }

    #[test]
    fn test_panicking_callback_still_cleans_up() {
        let sync = synchronizer();
        let tts = as_dyn(&TestObject::new("d1"));
        let broken = TestObject::build("d1", None, true);
        let broken_dyn = as_dyn(&broken);
        sync.prepare_sync(&tts);
        sync.prepare_sync(&broken_dyn);
        sync.release_sync_immediately(&tts);
        assert_eq!(broken.requests(), vec![true]);
        assert!(!sync.is_tracked(&broken_dyn));
        assert_eq!(sync.tracked_count(), 0);
    }

    #[test]
    fn test_dropped_objects_are_forgotten() {
        let sync = synchronizer();
        {
            let gone = as_dyn(&TestObject::new("d1"));
            sync.prepare_sync(&gone);
        }
        assert_eq!(sync.tracked_count(), 0);
    }
}
