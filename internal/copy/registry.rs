use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyState {
    InFlight,
    Succeeded,
    Failed(CopyFailure),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyFailure {
    SourceMissing,
    UploadError,
}

impl CopyState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InFlight)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in-flight",
            Self::Succeeded => "succeeded",
            Self::Failed(CopyFailure::SourceMissing) => "source-missing",
            Self::Failed(CopyFailure::UploadError) => "upload-error",
        }
    }
}

/// One copy lifecycle for one key. The state moves `InFlight` to exactly one
/// terminal value and never back; waiters observe the transition through the
/// watch channel.
pub struct CopyEntry {
    key: String,
    created_at: DateTime<Utc>,
    state: watch::Sender<CopyState>,
}

impl CopyEntry {
    fn new(key: &str) -> Self {
        let (state, _) = watch::channel(CopyState::InFlight);
        Self {
            key: key.to_string(),
            created_at: Utc::now(),
            state,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> CopyState {
        self.state.borrow().clone()
    }

    /// Publish a terminal state and release all waiters. Returns `false`
    /// when the entry is already terminal; the existing state stays put.
    pub fn publish(&self, next: CopyState) -> bool {
        if !next.is_terminal() {
            return false;
        }
        let mut published = false;
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next.clone();
            published = true;
            true
        });
        if !published {
            tracing::debug!(
                key = %self.key,
                state = %self.state().as_str(),
                "ignored transition on terminal copy entry"
            );
        }
        published
    }

    fn subscribe(&self) -> watch::Receiver<CopyState> {
        self.state.subscribe()
    }
}

/// Process-wide table of copy entries. `get_or_create` is the single point
/// that serializes concurrent requests for one key: exactly one caller sees
/// `created = true` and owns the copy.
#[derive(Clone, Default)]
pub struct CopyRegistry {
    entries: Arc<DashMap<String, Arc<CopyEntry>>>,
}

impl CopyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &str) -> (Arc<CopyEntry>, bool) {
        match self.entries.entry(key.to_string()) {
            dashmap::Entry::Occupied(existing) => (existing.get().clone(), false),
            dashmap::Entry::Vacant(slot) => {
                let entry = Arc::new(CopyEntry::new(key));
                slot.insert(entry.clone());
                (entry, true)
            }
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<CopyEntry>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed(CopyState),
    TimedOut,
}

/// Wait Gate: block until the entry turns terminal or `max_wait` elapses.
/// Timing out never cancels the copy; the entry keeps running and later
/// requests still observe its terminal state.
pub async fn await_copy(entry: &CopyEntry, max_wait: Duration) -> WaitOutcome {
    let mut updates = entry.subscribe();
    let outcome = match timeout(max_wait, updates.wait_for(|state| state.is_terminal())).await {
        Ok(Ok(state)) => WaitOutcome::Completed(state.clone()),
        // The sender lives inside the registry entry; a closed channel means
        // the entry was dropped mid-flight. Treat it as a failed upload so
        // the caller falls back to the source.
        Ok(Err(_)) => WaitOutcome::Completed(CopyState::Failed(CopyFailure::UploadError)),
        Err(_) => WaitOutcome::TimedOut,
    };
    outcome
}

#[cfg(test)]
mod tests {
    use super::{await_copy, CopyFailure, CopyRegistry, CopyState, WaitOutcome};
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn get_or_create_is_create_if_absent() {
        let registry = CopyRegistry::new();
        let (first, created) = registry.get_or_create("a/b");
        assert!(created);
        assert_eq!(first.state(), CopyState::InFlight);

        let (second, created) = registry.get_or_create("a/b");
        assert!(!created);
        assert_eq!(second.key(), first.key());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_returns_existing_entries_only() {
        let registry = CopyRegistry::new();
        assert!(registry.lookup("missing").is_none());
        assert!(registry.is_empty());

        registry.get_or_create("present");
        let entry = registry.lookup("present").expect("entry");
        assert_eq!(entry.key(), "present");
        assert!(entry.created_at() <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn concurrent_get_or_create_elects_one_owner() {
        let registry = CopyRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (_, created) = registry.get_or_create("contested");
                created
            }));
        }
        let mut owners = 0;
        for task in tasks {
            if task.await.expect("join") {
                owners += 1;
            }
        }
        assert_eq!(owners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn publish_is_monotonic() {
        let registry = CopyRegistry::new();
        let (entry, _) = registry.get_or_create("k");

        assert!(!entry.publish(CopyState::InFlight));
        assert!(entry.publish(CopyState::Succeeded));
        assert!(!entry.publish(CopyState::Failed(CopyFailure::UploadError)));
        assert_eq!(entry.state(), CopyState::Succeeded);
    }

    #[test]
    fn copy_state_labels() {
        assert_eq!(CopyState::InFlight.as_str(), "in-flight");
        assert_eq!(CopyState::Succeeded.as_str(), "succeeded");
        assert_eq!(
            CopyState::Failed(CopyFailure::SourceMissing).as_str(),
            "source-missing"
        );
        assert_eq!(
            CopyState::Failed(CopyFailure::UploadError).as_str(),
            "upload-error"
        );
        assert!(!CopyState::InFlight.is_terminal());
        assert!(CopyState::Succeeded.is_terminal());
    }

    #[tokio::test]
    async fn await_copy_observes_terminal_state() {
        let registry = CopyRegistry::new();
        let (entry, _) = registry.get_or_create("k");
        let waiter_entry = registry.lookup("k").expect("entry");

        let waiter = tokio::spawn(async move {
            await_copy(&waiter_entry, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(entry.publish(CopyState::Succeeded));

        let outcome = timeout(Duration::from_secs(2), waiter)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(outcome, WaitOutcome::Completed(CopyState::Succeeded));
    }

    #[tokio::test]
    async fn await_copy_returns_immediately_for_terminal_entry() {
        let registry = CopyRegistry::new();
        let (entry, _) = registry.get_or_create("k");
        entry.publish(CopyState::Failed(CopyFailure::SourceMissing));

        let outcome = await_copy(&entry, Duration::from_millis(10)).await;
        assert_eq!(
            outcome,
            WaitOutcome::Completed(CopyState::Failed(CopyFailure::SourceMissing))
        );
    }

    #[tokio::test]
    async fn await_copy_times_out_without_cancelling() {
        let registry = CopyRegistry::new();
        let (entry, _) = registry.get_or_create("k");

        let outcome = await_copy(&entry, Duration::from_millis(20)).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        // The copy is untouched by the waiter giving up.
        assert_eq!(entry.state(), CopyState::InFlight);
        entry.publish(CopyState::Succeeded);
        let outcome = await_copy(&entry, Duration::from_millis(20)).await;
        assert_eq!(outcome, WaitOutcome::Completed(CopyState::Succeeded));
    }

    #[tokio::test]
    async fn await_copy_releases_every_waiter() {
        let registry = CopyRegistry::new();
        let (entry, _) = registry.get_or_create("k");

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let entry = registry.lookup("k").expect("entry");
            waiters.push(tokio::spawn(async move {
                await_copy(&entry, Duration::from_secs(5)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        entry.publish(CopyState::Succeeded);

        for waiter in waiters {
            let outcome = waiter.await.expect("join");
            assert_eq!(outcome, WaitOutcome::Completed(CopyState::Succeeded));
        }
    }
}
