//! Listener registry.
//!
//! Listeners are callbacks (typically entities) invoked with a snapshot after
//! every refresh outcome. The registry does not own listener lifetime: each
//! subscriber holds a [`ListenerHandle`] and unsubscribes through it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::error;

use super::state::CoordinatorState;

/// A listener callback.
pub type Listener<T> = Arc<dyn Fn(&CoordinatorState<T>) + Send + Sync>;

type Slots<T> = Mutex<HashMap<u64, Listener<T>>>;

/// Type-erased removal, so handles don't carry the payload type.
trait Detach: Send + Sync {
    fn detach(&self, id: u64) -> bool;
    fn contains(&self, id: u64) -> bool;
}

impl<T: 'static> Detach for Slots<T> {
    fn detach(&self, id: u64) -> bool {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    fn contains(&self, id: u64) -> bool {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// Subscription handle returned by `add_listener`.
///
/// Dropping the handle does not unsubscribe; call [`ListenerHandle::unsubscribe`].
#[must_use = "the handle is the only way to remove the listener"]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<dyn Detach>,
}

impl ListenerHandle {
    /// Remove the listener. Idempotent, and a no-op once the coordinator is gone.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ListenerRegistry<T> {
    next_id: AtomicU64,
    slots: Arc<Slots<T>>,
}

impl<T: 'static> ListenerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Listener<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, listener: Listener<T>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, listener);

        let slots: Arc<dyn Detach> = self.slots.clone();
        ListenerHandle {
            id,
            registry: Arc::downgrade(&slots),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Invoke every listener with the same snapshot.
    ///
    /// The listener set is copied before iterating, so callbacks may subscribe
    /// or unsubscribe freely. A panicking listener is logged and skipped.
    pub(crate) fn notify_all(&self, name: &str, snapshot: &CoordinatorState<T>) {
        let listeners: Vec<Listener<T>> = self.lock().values().cloned().collect();

        for listener in listeners {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot)));
            if let Err(panic) = result {
                error!(
                    "Listener of {} panicked: {}",
                    name,
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
