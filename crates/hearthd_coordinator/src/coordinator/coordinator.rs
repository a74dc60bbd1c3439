use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::classify::DefaultClassifier;
use super::classify::FailureClassifier;
use super::classify::FailureKind;
use super::error::CoordinatorError;
use super::error::FetchTimeout;
use super::error::UpdateError;
use super::fetch::Fetcher;
use super::listener::ListenerHandle;
use super::listener::ListenerRegistry;
use super::listener::panic_message;
use super::state::CoordinatorState;
use super::state::Phase;
use crate::scheduler::Refresh;

/// Outcome of one fetch cycle, shared by every caller that joined it.
type CycleResult = Result<(), UpdateError>;

type InFlight = Shared<BoxFuture<'static, CycleResult>>;

type AuthHook = Box<dyn Fn(&UpdateError) + Send + Sync>;

/// Polling update coordinator.
///
/// Caches the last good payload from a [`Fetcher`], records the outcome of
/// every refresh and fans it out to listeners. Cloning is cheap and every
/// clone refers to the same coordinator.
///
/// At most one fetch is in flight at a time. A `refresh()` that arrives while
/// one is running waits for it and returns its outcome; it does not start a
/// second fetch and does not cause a second listener notification. The cycle
/// counts as in flight until its listeners have been notified.
pub struct Coordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    name: String,
    fetcher: Box<dyn Fetcher<T>>,
    classifier: Box<dyn FailureClassifier>,
    fetch_timeout: Option<Duration>,

    /// Set when listeners should not be told about an unchanged payload.
    data_eq: Option<fn(&T, &T) -> bool>,

    on_auth_failure: Option<AuthHook>,

    /// Current snapshot (readers load the Arc, writers store a new one)
    state: ArcSwap<CoordinatorState<T>>,

    listeners: ListenerRegistry<T>,

    in_flight: Mutex<Option<InFlight>>,

    shut_down: AtomicBool,
}

/// Builder for [`Coordinator`].
pub struct CoordinatorBuilder<T> {
    name: String,
    fetcher: Box<dyn Fetcher<T>>,
    classifier: Box<dyn FailureClassifier>,
    update_interval: Option<Duration>,
    fetch_timeout: Option<Duration>,
    data_eq: Option<fn(&T, &T) -> bool>,
    on_auth_failure: Option<AuthHook>,
}

impl<T: Send + Sync + 'static> CoordinatorBuilder<T> {
    /// Classifier for fetch errors (default: [`DefaultClassifier`]).
    pub fn classifier(mut self, classifier: impl FailureClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// Polling cadence. `None` (the default) leaves polling suspended.
    pub fn update_interval(mut self, interval: Option<Duration>) -> Self {
        self.update_interval = interval;
        self
    }

    /// Bound each fetch; exceeding it fails the fetch with [`FetchTimeout`].
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    /// Called after an auth failure has been recorded, before listeners run.
    ///
    /// The entry's lifecycle owner uses this to start re-authentication.
    pub fn on_auth_failure(mut self, hook: impl Fn(&UpdateError) + Send + Sync + 'static) -> Self {
        self.on_auth_failure = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Coordinator<T> {
        Coordinator {
            inner: Arc::new(Inner {
                name: self.name,
                fetcher: self.fetcher,
                classifier: self.classifier,
                fetch_timeout: self.fetch_timeout,
                data_eq: self.data_eq,
                on_auth_failure: self.on_auth_failure,
                state: ArcSwap::from_pointee(CoordinatorState::new(self.update_interval)),
                listeners: ListenerRegistry::new(),
                in_flight: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> CoordinatorBuilder<T> {
    /// Skip listener notification when a successful refresh returns the same
    /// payload as the previous successful refresh.
    pub fn skip_unchanged(mut self, skip: bool) -> Self {
        self.data_eq = skip.then_some(<T as PartialEq>::eq as fn(&T, &T) -> bool);
        self
    }
}

impl<T: Send + Sync + 'static> Coordinator<T> {
    pub fn builder(name: impl Into<String>, fetcher: impl Fetcher<T> + 'static) -> CoordinatorBuilder<T> {
        CoordinatorBuilder {
            name: name.into(),
            fetcher: Box::new(fetcher),
            classifier: Box::new(DefaultClassifier::default()),
            update_interval: None,
            fetch_timeout: None,
            data_eq: None,
            on_auth_failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state snapshot.
    pub fn state(&self) -> Arc<CoordinatorState<T>> {
        self.inner.state.load_full()
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.state.load().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.state.load().last_update_success
    }

    pub fn last_exception(&self) -> Option<UpdateError> {
        self.inner.state.load().last_exception.clone()
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.inner.state.load().update_interval
    }

    pub fn in_progress(&self) -> bool {
        self.inner.state.load().in_progress
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.load().phase
    }

    pub fn auth_failed(&self) -> bool {
        self.inner.state.load().auth_failed
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Subscribe to refresh outcomes.
    ///
    /// Safe to call from inside a listener; the new listener is first invoked on
    /// the next outcome.
    pub fn add_listener(
        &self,
        listener: impl Fn(&CoordinatorState<T>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Remove a listener. Idempotent.
    pub fn remove_listener(&self, handle: &ListenerHandle) {
        handle.unsubscribe();
    }

    /// Perform one fetch cycle, or join the one already in flight.
    ///
    /// Transient and auth failures are absorbed into state and reported to
    /// listeners; only a fatal failure is returned.
    pub async fn refresh(&self) -> Result<(), CoordinatorError> {
        if self.is_shut_down() {
            debug!("Skipping refresh of {}: shut down", self.inner.name);
            return Ok(());
        }

        match self.begin_or_join().await {
            Ok(()) => Ok(()),
            Err(source) => match source.kind() {
                FailureKind::Transient | FailureKind::Auth => Ok(()),
                FailureKind::Fatal => Err(CoordinatorError::Fatal {
                    name: self.inner.name.clone(),
                    source,
                }),
            },
        }
    }

    /// Setup-time refresh: every failure is returned to the caller.
    ///
    /// Integration setup calls this once before creating anything that
    /// depends on the data, so a failing first fetch fails the setup instead of
    /// producing entities that are broken from the start.
    pub async fn first_refresh(&self) -> Result<(), CoordinatorError> {
        if self.is_shut_down() {
            return Err(CoordinatorError::ShutDown(self.inner.name.clone()));
        }

        let name = self.inner.name.clone();
        match self.begin_or_join().await {
            Ok(()) => Ok(()),
            Err(source) => Err(match source.kind() {
                FailureKind::Transient => CoordinatorError::NotReady { name, source },
                FailureKind::Auth => CoordinatorError::AuthFailed { name, source },
                FailureKind::Fatal => CoordinatorError::Fatal { name, source },
            }),
        }
    }

    /// `Ok` only if the most recent refresh succeeded.
    pub fn ensure_last_update_success(&self) -> Result<(), CoordinatorError> {
        let state = self.inner.state.load();
        if state.last_update_success {
            return Ok(());
        }

        match &state.last_exception {
            Some(source) => Err(CoordinatorError::LastUpdateFailed {
                name: self.inner.name.clone(),
                source: source.clone(),
            }),
            None => Err(CoordinatorError::NeverRefreshed(self.inner.name.clone())),
        }
    }

    /// Record data pushed by the integration (e.g. from a websocket) as a
    /// successful update and notify listeners.
    pub fn set_updated_data(&self, data: T) {
        self.inner.apply_success(Arc::new(data), None);
    }

    /// Record a failure observed outside a fetch and notify listeners.
    pub fn set_update_error(&self, error: anyhow::Error) {
        let kind = self.inner.classifier.classify(&error);
        self.inner.apply_failure(UpdateError::new(kind, error), None);
    }

    /// Tear down: drop all listeners and skip any later refresh.
    ///
    /// A fetch already in flight is allowed to finish.
    pub fn shutdown(&self) {
        if !self.inner.shut_down.swap(true, Ordering::AcqRel) {
            self.inner.listeners.clear();
            info!("Coordinator {} shut down", self.inner.name);
        }
    }

    pub(crate) fn set_interval(&self, interval: Option<Duration>) {
        self.inner.update_state(|state| state.update_interval = interval);
    }

    /// Return the in-flight cycle, starting one if none is running.
    ///
    /// The cycle runs in its own task, so dropping every waiter never cancels
    /// the fetch.
    fn begin_or_join(&self) -> InFlight {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(in_flight) = slot.as_ref() {
            debug!("Refresh of {} already in progress, joining it", self.inner.name);
            return in_flight.clone();
        }

        self.inner.update_state(|state| {
            state.in_progress = true;
            state.phase = Phase::Refreshing;
        });

        let inner = self.inner.clone();
        let task = tokio::spawn(inner.run_cycle());

        let name = self.inner.name.clone();
        let in_flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(UpdateError::new(
                    FailureKind::Transient,
                    anyhow::anyhow!("refresh of {} did not complete: {}", name, e),
                )),
            }
        }
        .boxed()
        .shared();

        *slot = Some(in_flight.clone());
        in_flight
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Refresh for Coordinator<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn update_interval(&self) -> Option<Duration> {
        Coordinator::update_interval(self)
    }

    fn set_update_interval(&self, interval: Option<Duration>) {
        self.set_interval(interval);
    }

    async fn refresh(&self) -> Result<(), CoordinatorError> {
        Coordinator::refresh(self).await
    }
}

/// Releases the in-flight slot when a cycle ends, however it ends.
struct InFlightGuard<T: Send + Sync + 'static>(Arc<Inner<T>>);

impl<T: Send + Sync + 'static> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        self.0
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // Only still set if the cycle was cancelled before recording an outcome.
        if self.0.state.load().in_progress {
            self.0.update_state(|state| {
                state.in_progress = false;
                state.phase = Phase::Idle;
            });
        }
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// Apply `update` to a copy of the current snapshot and swap it in.
    fn update_state(&self, update: impl Fn(&mut CoordinatorState<T>)) -> Arc<CoordinatorState<T>> {
        let mut stored = None;
        self.state.rcu(|current| {
            let mut next = CoordinatorState::clone(current);
            update(&mut next);
            let next = Arc::new(next);
            stored = Some(next.clone());
            next
        });
        stored.unwrap_or_else(|| self.state.load_full())
    }

    async fn run_cycle(self: Arc<Self>) -> CycleResult {
        let guard = InFlightGuard(self.clone());
        let started = Instant::now();

        let result = self.fetch().await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(data) => {
                self.apply_success(Arc::new(data), Some(guard));
                Ok(())
            }
            Err(error) => {
                let kind = self.classifier.classify(&error);
                let update = UpdateError::new(kind, error);
                self.apply_failure(update.clone(), Some(guard));
                Err(update)
            }
        };

        debug!(
            "Finished fetching {} data in {:.3} seconds (success: {})",
            self.name,
            elapsed.as_secs_f64(),
            outcome.is_ok()
        );

        outcome
    }

    /// Call the fetcher, applying the timeout and turning a panic into an error.
    async fn fetch(&self) -> anyhow::Result<T> {
        let fetch = AssertUnwindSafe(self.fetcher.fetch()).catch_unwind();

        let result = match self.fetch_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => result,
                Err(_) => return Err(FetchTimeout(limit).into()),
            },
            None => fetch.await,
        };

        result.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "fetcher panicked: {}",
                panic_message(panic.as_ref())
            ))
        })
    }

    fn apply_success(&self, data: Arc<T>, guard: Option<InFlightGuard<T>>) {
        let from_fetch = guard.is_some();
        let previous = self.state.load_full();

        let snapshot = self.update_state(|state| {
            state.data = Some(data.clone());
            state.last_update_success = true;
            state.last_exception = None;
            state.auth_failed = false;
            state.last_update_success_time = Some(SystemTime::now());
            if from_fetch {
                state.in_progress = false;
            }
            if !state.in_progress {
                state.phase = Phase::Succeeded;
            }
        });

        if !previous.last_update_success && previous.last_exception.is_some() {
            info!("Fetching {} data recovered", self.name);
        }

        let unchanged = match (self.data_eq, previous.data.as_deref()) {
            (Some(eq), Some(old)) => previous.last_update_success && eq(old, data.as_ref()),
            _ => false,
        };

        if unchanged {
            debug!("{} data unchanged, not notifying listeners", self.name);
        } else {
            self.listeners.notify_all(&self.name, &snapshot);
        }

        self.settle();
        // Held through fan-out: a refresh arriving now joins this cycle.
        drop(guard);
    }

    fn apply_failure(&self, update: UpdateError, guard: Option<InFlightGuard<T>>) {
        let from_fetch = guard.is_some();
        let kind = update.kind();
        let previous = self.state.load_full();

        let snapshot = self.update_state(|state| {
            state.last_update_success = false;
            state.last_exception = Some(update.clone());
            if kind == FailureKind::Auth {
                state.auth_failed = true;
            }
            if from_fetch {
                state.in_progress = false;
            }
            if !state.in_progress {
                state.phase = match kind {
                    FailureKind::Fatal => Phase::Idle,
                    FailureKind::Transient | FailureKind::Auth => Phase::Failed(kind),
                };
            }
        });

        // Only log loudly on the transition into failure.
        let already_failing = !previous.last_update_success && previous.last_exception.is_some();

        match kind {
            FailureKind::Transient => {
                if already_failing {
                    debug!("Error fetching {} data: {}", self.name, update);
                } else {
                    error!("Error fetching {} data: {}", self.name, update);
                }
                self.listeners.notify_all(&self.name, &snapshot);
                self.settle();
            }
            FailureKind::Auth => {
                warn!(
                    "Authentication failed while fetching {} data, re-authentication required: {}",
                    self.name, update
                );
                if let Some(hook) = &self.on_auth_failure {
                    let result = std::panic::catch_unwind(AssertUnwindSafe(|| hook(&update)));
                    if let Err(panic) = result {
                        error!(
                            "Auth failure hook of {} panicked: {}",
                            self.name,
                            panic_message(panic.as_ref())
                        );
                    }
                }
                self.listeners.notify_all(&self.name, &snapshot);
                self.settle();
            }
            FailureKind::Fatal => {
                error!("Fatal error fetching {} data: {}", self.name, update);
            }
        }

        drop(guard);
    }

    /// Return to `Idle` once listeners have seen the outcome, unless another
    /// refresh has started meanwhile.
    fn settle(&self) {
        self.update_state(|state| {
            if !state.in_progress && matches!(state.phase, Phase::Succeeded | Phase::Failed(_)) {
                state.phase = Phase::Idle;
            }
        });
    }
}
