//! Autosave controller: the dirty/clean state machine for a document
//! snapshot, with debounced remote commits.
//!
//! One controller per document session owns all of the state: the
//! pending snapshot, the serialized form last confirmed remote, the
//! debounce timer, and the in-flight guard. Dirtiness is always
//! recomputed from the two serialized forms, never set on its own, so an
//! edit that round-trips back to the synced form costs no network
//! traffic at all.
//!
//! Edits that arrive while a save is in flight mutate the live pending
//! state, not the copy being saved; the completed save is then treated
//! as stale and the newer edit stays dirty. Failed saves are logged and
//! re-marked dirty; an autosave failure is never surfaced to the user,
//! it just means "still dirty, will retry".

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Delay between the most recent dirty edit and the scheduled commit.
pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_secs(2 * 60);

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// Debounce delay: a burst of edits collapses into one save this
    /// long after the last of them.
    pub delay: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            delay: DEFAULT_AUTOSAVE_DELAY,
        }
    }
}

/// Confirmation that a backup was committed remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    /// Epoch ms the remote store acknowledged the write.
    pub saved_at: i64,
}

/// The remote persistence collaborator.
#[async_trait]
pub trait BackupSink: Send + Sync {
    /// Persist an automatic backup of `snapshot` for `document_id`.
    ///
    /// `Ok(None)` is an empty receipt and counts as a failed save.
    async fn save_auto_backup(
        &self,
        snapshot: &Value,
        document_id: &str,
    ) -> anyhow::Result<Option<SaveReceipt>>;
}

/// Observable controller state, for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutosaveStateSnapshot {
    pub dirty: bool,
    pub in_flight: bool,
    pub timer_scheduled: bool,
    pub pending_snapshot: Option<Value>,
    pub pending_form: Option<String>,
    pub last_synced_form: Option<String>,
}

#[derive(Default)]
struct AutosaveState {
    dirty: bool,
    last_synced_form: Option<String>,
    pending_snapshot: Option<Value>,
    pending_form: Option<String>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every (re)schedule so a firing timer task can tell
    /// whether the registered handle is still its own.
    timer_generation: u64,
    in_flight: bool,
}

struct Inner {
    sink: Arc<dyn BackupSink>,
    document_id: Box<dyn Fn() -> Option<String> + Send + Sync>,
    delay: Duration,
    state: Mutex<AutosaveState>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The timer task only holds a weak handle back to us, so the
        // last controller clone going away cancels any pending save.
        if let Ok(state) = self.state.get_mut()
            && let Some(timer) = state.timer.take()
        {
            timer.abort();
        }
    }
}

/// Autosave controller for one document session.
#[derive(Clone)]
pub struct AutosaveController {
    inner: Arc<Inner>,
}

impl AutosaveController {
    /// `document_id` is the injected "which document is active" accessor;
    /// returning `None` makes a scheduled save reschedule itself rather
    /// than drop the edit.
    pub fn new(
        sink: Arc<dyn BackupSink>,
        document_id: impl Fn() -> Option<String> + Send + Sync + 'static,
        config: AutosaveConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                document_id: Box::new(document_id),
                delay: config.delay,
                state: Mutex::new(AutosaveState::default()),
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, AutosaveState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an edited snapshot.
    ///
    /// If its serialized form differs from the last synced form the
    /// controller goes dirty and (re)schedules the debounced commit,
    /// replacing any earlier timer. If it matches, the edit round-tripped
    /// back to the synced state: the controller goes clean and the timer
    /// is cancelled, so a UI re-sending an unchanged snapshot never
    /// re-triggers network traffic.
    pub fn mark_dirty(&self, snapshot: Value, serialized: Option<String>) {
        let form = stable_form(&snapshot, serialized);
        let mut state = self.locked();
        self.mark_dirty_locked(&mut state, snapshot, form);
    }

    /// Adopt a snapshot as the confirmed remote copy: clean, no timer.
    ///
    /// Called after a successful autosave, and by callers that know the
    /// two copies agree for other reasons (an explicit manual save).
    pub fn mark_synced(&self, snapshot: Value, serialized: Option<String>) {
        let form = stable_form(&snapshot, serialized);
        let mut state = self.locked();
        state.pending_snapshot = Some(snapshot);
        state.pending_form = Some(form.clone());
        state.last_synced_form = Some(form);
        state.dirty = false;
        cancel_timer(&mut state);
    }

    pub fn is_dirty(&self) -> bool {
        self.locked().dirty
    }

    /// Observable copy of the controller state.
    pub fn state(&self) -> AutosaveStateSnapshot {
        let state = self.locked();
        AutosaveStateSnapshot {
            dirty: state.dirty,
            in_flight: state.in_flight,
            timer_scheduled: state.timer.is_some(),
            pending_snapshot: state.pending_snapshot.clone(),
            pending_form: state.pending_form.clone(),
            last_synced_form: state.last_synced_form.clone(),
        }
    }

    /// Commit the pending snapshot now.
    ///
    /// Safe to call without a timer having fired (a caller's own flush
    /// logic), and reentrant-safe: while a save is in flight a concurrent
    /// call is a silent no-op, so the same document never has two
    /// overlapping commits.
    pub async fn perform_scheduled_save(&self) {
        let (snapshot, form, document_id) = {
            let mut state = self.locked();
            if state.in_flight || !state.dirty {
                return;
            }
            let Some(snapshot) = state.pending_snapshot.clone() else {
                return;
            };
            let Some(form) = state.pending_form.clone() else {
                return;
            };
            cancel_timer(&mut state);
            let Some(document_id) = (self.inner.document_id)() else {
                // No active document to file the backup under; keep the
                // edit and try again after another delay.
                debug!("autosave deferred, no active document");
                self.schedule_locked(&mut state);
                return;
            };
            state.in_flight = true;
            (snapshot, form, document_id)
        };

        let result = self.inner.sink.save_auto_backup(&snapshot, &document_id).await;

        match result {
            Ok(Some(receipt)) => {
                let mut state = self.locked();
                if state.pending_form.as_deref() == Some(form.as_str()) {
                    debug!(saved_at = receipt.saved_at, "autosave committed");
                    state.last_synced_form = Some(form);
                    state.dirty = false;
                    cancel_timer(&mut state);
                } else {
                    // An edit raced in during the await. The save that
                    // just completed is stale; the live state stays dirty.
                    debug!("autosave superseded by a newer edit");
                }
            }
            Ok(None) => {
                warn!("autosave returned an empty receipt, keeping snapshot dirty");
                self.remark_current_dirty(snapshot, form);
            }
            Err(err) => {
                warn!(error = %err, "scheduled autosave failed, keeping snapshot dirty");
                self.remark_current_dirty(snapshot, form);
            }
        }

        let mut state = self.locked();
        state.in_flight = false;
        if state.dirty && state.timer.is_none() {
            self.schedule_locked(&mut state);
        }
    }

    /// Failure path: re-mark dirty with whichever snapshot is most
    /// current, preferring a live edit over the one just attempted.
    fn remark_current_dirty(&self, attempted: Value, attempted_form: String) {
        let mut state = self.locked();
        let snapshot = state.pending_snapshot.clone().unwrap_or(attempted);
        let form = state.pending_form.clone().unwrap_or(attempted_form);
        self.mark_dirty_locked(&mut state, snapshot, form);
    }

    fn mark_dirty_locked(
        &self,
        state: &mut MutexGuard<'_, AutosaveState>,
        snapshot: Value,
        form: String,
    ) {
        state.pending_snapshot = Some(snapshot);
        state.pending_form = Some(form.clone());
        if state.last_synced_form.as_deref() != Some(form.as_str()) {
            state.dirty = true;
            self.schedule_locked(state);
        } else {
            state.dirty = false;
            cancel_timer(state);
        }
    }

    /// Replace any scheduled timer with a fresh one: the delay runs from
    /// the most recent dirty edit, not at a fixed rate.
    fn schedule_locked(&self, state: &mut MutexGuard<'_, AutosaveState>) {
        cancel_timer(state);
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.delay;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let controller = AutosaveController { inner };
            {
                // This timer has fired; forget its handle so the save
                // does not cancel itself. A newer generation means the
                // registered handle belongs to a replacement timer.
                let mut state = controller.locked();
                if state.timer_generation == generation {
                    state.timer = None;
                }
            }
            controller.perform_scheduled_save().await;
        }));
    }
}

fn cancel_timer(state: &mut AutosaveState) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
}

/// Stable serialized form used for equality checks only, never reparsed
/// as the source of truth.
fn stable_form(snapshot: &Value, serialized: Option<String>) -> String {
    // Serializing a `Value` cannot fail; the fallback keeps the
    // signature honest without an unwrap.
    serialized.unwrap_or_else(|| serde_json::to_string(snapshot).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Scripted sink: pops the next planned response per call, optionally
    /// gating each save between `started` and `release` notifications.
    struct TestSink {
        calls: AtomicUsize,
        responses: Mutex<VecDeque<anyhow::Result<Option<SaveReceipt>>>>,
        gated: bool,
        started: Notify,
        release: Notify,
        saved: Mutex<Vec<(Value, String)>>,
    }

    impl TestSink {
        fn with_gating(gated: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(VecDeque::new()),
                gated,
                started: Notify::new(),
                release: Notify::new(),
                saved: Mutex::new(Vec::new()),
            })
        }

        fn new() -> Arc<Self> {
            Self::with_gating(false)
        }

        fn gated() -> Arc<Self> {
            Self::with_gating(true)
        }

        fn plan(&self, response: anyhow::Result<Option<SaveReceipt>>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn saved_ids(&self) -> Vec<String> {
            self.saved.lock().unwrap().iter().map(|(_, id)| id.clone()).collect()
        }
    }

    #[async_trait]
    impl BackupSink for TestSink {
        async fn save_auto_backup(
            &self,
            snapshot: &Value,
            document_id: &str,
        ) -> anyhow::Result<Option<SaveReceipt>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saved
                .lock()
                .unwrap()
                .push((snapshot.clone(), document_id.to_string()));
            if self.gated {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Some(SaveReceipt { saved_at: 1 })))
        }
    }

    fn controller_with(sink: Arc<TestSink>, delay: Duration) -> AutosaveController {
        AutosaveController::new(
            sink,
            || Some("Vex the Bold".to_string()),
            AutosaveConfig { delay },
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn unchanged_snapshot_goes_clean_and_cancels_the_timer() {
        let sink = TestSink::new();
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        controller.mark_synced(json!({"hp": 10}), None);
        assert!(!controller.is_dirty());

        controller.mark_dirty(json!({"hp": 12}), None);
        assert!(controller.is_dirty());
        assert!(controller.state().timer_scheduled);

        // The edit round-trips back to the synced form: no save owed.
        controller.mark_dirty(json!({"hp": 10}), None);
        assert!(!controller.is_dirty());
        assert!(!controller.state().timer_scheduled);
        assert_eq!(0, sink.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_save_after_the_delay() {
        let sink = TestSink::new();
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        controller.mark_dirty(json!({"hp": 1}), None);
        tokio::time::advance(Duration::from_secs(60)).await;
        controller.mark_dirty(json!({"hp": 2}), None);

        // 119s after the second edit: the first timer would already have
        // fired, the replacement one must not have.
        tokio::time::advance(Duration::from_secs(119)).await;
        settle().await;
        assert_eq!(0, sink.calls());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(1, sink.calls());
        assert!(!controller.is_dirty());
        assert_eq!(
            Some("{\"hp\":2}".to_string()),
            controller.state().last_synced_form
        );
        assert_eq!(vec!["Vex the Bold".to_string()], sink.saved_ids());
    }

    #[tokio::test]
    async fn flush_is_safe_without_a_timer_and_reentrant() {
        let sink = TestSink::gated();
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        // Clean controller: flushing does nothing.
        controller.perform_scheduled_save().await;
        assert_eq!(0, sink.calls());

        controller.mark_dirty(json!({"hp": 1}), None);
        let flush = tokio::spawn({
            let controller = controller.clone();
            async move { controller.perform_scheduled_save().await }
        });
        sink.started.notified().await;

        // A concurrent flush while the save is in flight is a no-op.
        controller.perform_scheduled_save().await;
        assert_eq!(1, sink.calls());

        sink.release.notify_one();
        flush.await.expect("flush task");
        assert!(!controller.is_dirty());
    }

    #[tokio::test]
    async fn edit_during_save_is_never_lost() {
        let sink = TestSink::gated();
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        controller.mark_dirty(json!({"hp": 1}), None);
        let flush = tokio::spawn({
            let controller = controller.clone();
            async move { controller.perform_scheduled_save().await }
        });
        sink.started.notified().await;

        // Race a newer edit in while the save holds the old snapshot.
        controller.mark_dirty(json!({"hp": 2}), None);
        sink.release.notify_one();
        flush.await.expect("flush task");

        // The completed save covered hp=1 only; the newer edit is still
        // pending and dirty, with a timer to carry it.
        assert!(controller.is_dirty());
        assert_eq!(
            Some(json!({"hp": 2})),
            controller.state().pending_snapshot
        );
        assert!(controller.state().timer_scheduled);
        assert_eq!(1, sink.calls());
    }

    #[tokio::test]
    async fn rejection_keeps_the_snapshot_dirty_and_reschedules() {
        let sink = TestSink::new();
        sink.plan(Err(anyhow::anyhow!("backend unavailable")));
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        controller.mark_dirty(json!({"hp": 3}), None);
        controller.perform_scheduled_save().await;

        let state = controller.state();
        assert!(state.dirty);
        assert_eq!(Some(json!({"hp": 3})), state.pending_snapshot);
        assert!(state.timer_scheduled);
        assert!(!state.in_flight);
    }

    #[tokio::test]
    async fn empty_receipt_counts_as_failure() {
        let sink = TestSink::new();
        sink.plan(Ok(None));
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        controller.mark_dirty(json!({"hp": 4}), None);
        controller.perform_scheduled_save().await;

        assert!(controller.is_dirty());
        assert!(controller.state().timer_scheduled);

        // The next attempt goes through and cleans up.
        controller.perform_scheduled_save().await;
        assert!(!controller.is_dirty());
        assert_eq!(2, sink.calls());
    }

    #[tokio::test]
    async fn missing_document_identity_defers_instead_of_dropping() {
        let sink = TestSink::new();
        let current: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let accessor = Arc::clone(&current);
        let controller = AutosaveController::new(
            Arc::clone(&sink) as Arc<dyn BackupSink>,
            move || accessor.lock().unwrap().clone(),
            AutosaveConfig {
                delay: Duration::from_secs(120),
            },
        );

        controller.mark_dirty(json!({"hp": 5}), None);
        controller.perform_scheduled_save().await;
        assert_eq!(0, sink.calls());
        assert!(controller.is_dirty());
        assert!(controller.state().timer_scheduled);

        *current.lock().unwrap() = Some("Vex the Bold".to_string());
        controller.perform_scheduled_save().await;
        assert_eq!(1, sink.calls());
        assert!(!controller.is_dirty());
    }

    #[tokio::test]
    async fn explicit_serialized_form_wins_over_recomputing() {
        let sink = TestSink::new();
        let controller = controller_with(Arc::clone(&sink), Duration::from_secs(120));

        // Caller-supplied forms are compared verbatim, so two snapshots a
        // serializer would render differently can still count as equal.
        controller.mark_synced(json!({"hp": 6}), Some("form-a".to_string()));
        controller.mark_dirty(json!({"hp": 7}), Some("form-a".to_string()));
        assert!(!controller.is_dirty());

        controller.mark_dirty(json!({"hp": 7}), Some("form-b".to_string()));
        assert!(controller.is_dirty());
    }
}
