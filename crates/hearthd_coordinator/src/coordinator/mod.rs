mod classify;
#[allow(clippy::module_inception)]
mod coordinator;
mod error;
mod fetch;
mod listener;
mod state;

pub use classify::DefaultClassifier;
pub use classify::FailureClassifier;
pub use classify::FailureKind;
pub use coordinator::Coordinator;
pub use coordinator::CoordinatorBuilder;
pub use error::AuthFailed;
pub use error::CoordinatorError;
pub use error::FetchTimeout;
pub use error::UpdateError;
pub use error::UpdateFailed;
pub use fetch::BlockingFetcher;
pub use fetch::FnFetcher;
pub use fetch::Fetcher;
pub use fetch::blocking_fn;
pub use fetch::fetch_fn;
pub use listener::Listener;
pub use listener::ListenerHandle;
pub use state::CoordinatorState;
pub use state::Phase;
