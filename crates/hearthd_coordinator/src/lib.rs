pub mod api;
pub mod config;
mod coordinator;
pub mod entry;
pub mod scheduler;
pub mod sources;

pub use config::Config;
pub use config::LogLevel;
pub use coordinator::AuthFailed;
pub use coordinator::BlockingFetcher;
pub use coordinator::Coordinator;
pub use coordinator::CoordinatorBuilder;
pub use coordinator::CoordinatorError;
pub use coordinator::CoordinatorState;
pub use coordinator::DefaultClassifier;
pub use coordinator::FailureClassifier;
pub use coordinator::FailureKind;
pub use coordinator::FetchTimeout;
pub use coordinator::Fetcher;
pub use coordinator::FnFetcher;
pub use coordinator::Listener;
pub use coordinator::ListenerHandle;
pub use coordinator::Phase;
pub use coordinator::UpdateError;
pub use coordinator::UpdateFailed;
pub use coordinator::blocking_fn;
pub use coordinator::fetch_fn;
pub use entry::Entries;
pub use entry::Entry;
pub use entry::EntryEvent;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerOptions;
