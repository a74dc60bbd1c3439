//! Entry lifecycle.
//!
//! An [`Entry`] is one configured integration instance. It owns its
//! coordinator and scheduler outright; nothing looks them up through shared
//! global state. Setup performs the first refresh before polling starts, and
//! unload tears both down. An entry whose source isn't ready yet is retried
//! with [`retry_setup`]; loaded entries are published through [`Entries`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorError;
use crate::coordinator::CoordinatorState;
use crate::coordinator::ListenerHandle;
use crate::coordinator::UpdateError;
use crate::scheduler::Scheduler;
use crate::scheduler::SchedulerOptions;

/// Lifecycle events reported by entries to their owner.
#[derive(Debug, Clone)]
pub enum EntryEvent {
    /// Credentials were rejected; the entry needs re-authentication.
    ReauthRequired { entry_id: String, error: UpdateError },
}

/// Unbounded so the auth hook, which runs inside a refresh, never blocks.
pub type EntryEventSender = mpsc::UnboundedSender<EntryEvent>;
pub type EntryEventReceiver = mpsc::UnboundedReceiver<EntryEvent>;

/// Build an auth-failure hook that reports [`EntryEvent::ReauthRequired`].
///
/// Pass the result to `CoordinatorBuilder::on_auth_failure`.
pub fn reauth_reporter(
    entry_id: impl Into<String>,
    events: EntryEventSender,
) -> impl Fn(&UpdateError) + Send + Sync + 'static {
    let entry_id = entry_id.into();
    move |error| {
        let event = EntryEvent::ReauthRequired {
            entry_id: entry_id.clone(),
            error: error.clone(),
        };
        if events.send(event).is_err() {
            warn!("[{}] Failed to report re-authentication request", entry_id);
        }
    }
}

pub struct Entry<T> {
    entry_id: String,
    coordinator: Coordinator<T>,
    scheduler: Scheduler,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl<T: Send + Sync + 'static> Entry<T> {
    /// Populate the coordinator, then start polling.
    ///
    /// If the first refresh fails the coordinator is shut down and the error
    /// returned; no scheduler is started.
    pub async fn setup(
        entry_id: impl Into<String>,
        coordinator: Coordinator<T>,
        options: SchedulerOptions,
    ) -> Result<Self, CoordinatorError> {
        let entry_id = entry_id.into();
        info!("[{}] Setting up entry", entry_id);

        if let Err(e) = coordinator.first_refresh().await {
            coordinator.shutdown();
            return Err(e);
        }

        let scheduler = Scheduler::new(coordinator.clone(), options);
        scheduler.start();

        info!("[{}] Entry setup complete", entry_id);
        Ok(Self {
            entry_id,
            coordinator,
            scheduler,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn coordinator(&self) -> &Coordinator<T> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Attach a listener whose lifetime is tied to the entry.
    pub fn add_listener(&self, listener: impl Fn(&CoordinatorState<T>) + Send + Sync + 'static) {
        let handle = self.coordinator.add_listener(listener);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Stop polling, drop listeners and shut the coordinator down.
    pub fn unload(&self) {
        info!("[{}] Unloading entry", self.entry_id);
        self.scheduler.stop();

        for handle in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.unsubscribe();
        }

        self.coordinator.shutdown();
    }
}

/// Delay before setup attempt `tries + 1`: 5s doubling up to 80s.
pub fn setup_retry_delay(tries: u32) -> Duration {
    Duration::from_secs(5 * 2u64.pow(tries.min(4)))
}

fn is_not_ready(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<CoordinatorError>(),
        Some(CoordinatorError::NotReady { .. })
    )
}

/// Run `attempt` until it succeeds or fails with something other than
/// [`CoordinatorError::NotReady`].
///
/// Auth and fatal setup failures are returned straight away; retrying them
/// can't succeed without a config change.
pub async fn retry_setup<T, F, Fut>(entry_id: &str, mut attempt: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut tries = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if is_not_ready(&e) => {
                let delay = setup_retry_delay(tries);
                tries += 1;
                warn!(
                    "[{}] {:#}; retrying setup in {}s (attempt {})",
                    entry_id,
                    e,
                    delay.as_secs(),
                    tries + 1
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Loaded entries keyed by entry id.
///
/// Readers get a consistent snapshot without locking; entries are added as
/// their setup completes.
pub struct Entries<T> {
    map: ArcSwap<BTreeMap<String, Arc<Entry<T>>>>,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            map: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }
}

impl<T: Send + Sync + 'static> Entries<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `entry`, replacing any entry with the same id.
    pub fn insert(&self, entry: Entry<T>) -> Arc<Entry<T>> {
        let entry = Arc::new(entry);
        self.map.rcu(|map| {
            let mut map = BTreeMap::clone(map);
            map.insert(entry.entry_id().to_string(), entry.clone());
            map
        });
        entry
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<Entry<T>>> {
        self.map.load().get(entry_id).cloned()
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<String, Arc<Entry<T>>>> {
        self.map.load_full()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    pub fn unload_all(&self) {
        for entry in self.map.load().values() {
            entry.unload();
        }
    }
}
