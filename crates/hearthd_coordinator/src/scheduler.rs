//! Polling scheduler.
//!
//! Decides *when* a coordinator refreshes. Each running scheduler is a tokio
//! task that owns the next deadline and is driven by a command channel, so
//! `reschedule` and `request_refresh` never wait on an in-flight fetch.
//!
//! Cadence rules:
//! - A periodic tick fires `update_interval` after the previous tick, after
//!   `start()` (unless `refresh_on_start`), or after `reschedule()`.
//! - `request_refresh()` runs immediately, then opens a cooldown window.
//!   Requests inside the window collapse into one refresh at its end.
//! - Any out-of-band refresh pushes the next periodic tick to a full interval
//!   after it, so a request just before a tick does not cause two fetches.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::coordinator::CoordinatorError;

/// Default cooldown between out-of-band refreshes.
pub const DEFAULT_REQUEST_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// Something the scheduler can refresh.
///
/// Implemented by [`Coordinator`](crate::Coordinator).
#[async_trait]
pub trait Refresh: Send + Sync {
    fn name(&self) -> &str;

    fn update_interval(&self) -> Option<Duration>;

    /// Record a new cadence. Only the scheduler calls this.
    fn set_update_interval(&self, interval: Option<Duration>);

    async fn refresh(&self) -> Result<(), CoordinatorError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Fire the first tick as soon as the scheduler starts.
    pub refresh_on_start: bool,

    /// Minimum spacing between out-of-band refreshes.
    pub request_refresh_cooldown: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            refresh_on_start: false,
            request_refresh_cooldown: DEFAULT_REQUEST_REFRESH_COOLDOWN,
        }
    }
}

#[derive(Debug)]
enum Command {
    Reschedule(Option<Duration>),
    RequestRefresh,
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct Inner {
    target: Arc<dyn Refresh>,
    options: SchedulerOptions,
    running: Mutex<Option<Running>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let running = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.task.abort();
        }
    }
}

/// Drives a [`Refresh`] target on its update interval.
///
/// Cloning is cheap and every clone controls the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(target: impl Refresh + 'static, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                target: Arc::new(target),
                options,
                running: Mutex::new(None),
            }),
        }
    }

    /// Start polling. Calling `start` on a running scheduler does nothing.
    pub fn start(&self) {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            self.inner.target.clone(),
            rx,
            self.inner.options.clone(),
        ));

        info!(
            "Started polling {} (interval: {:?})",
            self.inner.target.name(),
            self.inner.target.update_interval()
        );
        *running = Some(Running { commands, task });
    }

    /// Stop polling. Idempotent, and safe on a scheduler that never started.
    ///
    /// A refresh that is already running completes; only the timer is cancelled.
    pub fn stop(&self) {
        if let Some(running) = self.lock().take() {
            running.task.abort();
            info!("Stopped polling {}", self.inner.target.name());
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Replace the polling interval, measuring the next tick from now.
    ///
    /// `None` suspends periodic polling; `request_refresh` still works.
    pub fn reschedule(&self, interval: Option<Duration>) {
        self.inner.target.set_update_interval(interval);
        debug!(
            "Rescheduled {} (interval: {:?})",
            self.inner.target.name(),
            interval
        );
        self.send(Command::Reschedule(interval));
    }

    /// Ask for an out-of-band refresh, subject to the cooldown.
    ///
    /// On a scheduler that is not running the refresh is spawned immediately.
    pub fn request_refresh(&self) {
        if !self.send(Command::RequestRefresh) {
            spawn_refresh(&self.inner.target);
        }
    }

    fn send(&self, command: Command) -> bool {
        match self.lock().as_ref() {
            Some(running) => running.commands.send(command).is_ok(),
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Refresh in a separate task so the scheduler loop never blocks on a fetch.
fn spawn_refresh(target: &Arc<dyn Refresh>) {
    let target = target.clone();
    tokio::spawn(async move {
        if let Err(e) = target.refresh().await {
            warn!("Refresh of {} failed: {}", target.name(), e);
        }
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(
    target: Arc<dyn Refresh>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    options: SchedulerOptions,
) {
    let mut interval = target.update_interval();
    let started = Instant::now();

    let mut next_tick = if options.refresh_on_start {
        Some(started)
    } else {
        interval.map(|i| started + i)
    };
    let mut cooldown_until: Option<Instant> = None;
    let mut trailing: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = sleep_until(next_tick) => {
                debug!("Periodic refresh of {}", target.name());
                spawn_refresh(&target);
                next_tick = interval.map(|i| Instant::now() + i);
            }
            _ = sleep_until(trailing) => {
                debug!("Debounced refresh of {}", target.name());
                trailing = None;
                spawn_refresh(&target);
                let now = Instant::now();
                cooldown_until = Some(now + options.request_refresh_cooldown);
                next_tick = interval.map(|i| now + i);
            }
            command = commands.recv() => match command {
                Some(Command::Reschedule(new_interval)) => {
                    interval = new_interval;
                    next_tick = interval.map(|i| Instant::now() + i);
                }
                Some(Command::RequestRefresh) => {
                    let now = Instant::now();
                    match cooldown_until {
                        Some(until) if now < until => {
                            if trailing.is_none() {
                                debug!(
                                    "Refresh of {} requested during cooldown, deferring",
                                    target.name()
                                );
                                trailing = Some(until);
                            }
                        }
                        _ => {
                            debug!("Requested refresh of {}", target.name());
                            spawn_refresh(&target);
                            cooldown_until = Some(now + options.request_refresh_cooldown);
                            next_tick = interval.map(|i| now + i);
                        }
                    }
                }
                None => break,
            },
        }
    }

    debug!("Scheduler for {} exiting", target.name());
}
