//! Data sources.
//!
//! A source turns an entry's `source` table into a [`Fetcher`] producing JSON.
//! Sources register a factory in [`REGISTRY`]; each factory inspects the entry
//! config and returns `Ok(None)` when the entry is not its kind.

mod command;
#[cfg(feature = "source_http")]
mod http;

use anyhow::Context;
use linkme::distributed_slice;
use serde_json::Value;
use tracing::debug;

use crate::config::EntryConfig;
use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorState;
use crate::coordinator::Fetcher;
use crate::entry::Entry;
use crate::entry::EntryEventSender;
use crate::entry::reauth_reporter;
use crate::entry::retry_setup;

pub use command::CommandSource;
#[cfg(feature = "source_http")]
pub use http::HttpSource;

/// Result type for source factory functions
pub type SourceFactoryResult = anyhow::Result<Option<Box<dyn Fetcher<Value>>>>;

pub struct SourceContext<'a> {
    pub entry_id: &'a str,
    pub config: &'a EntryConfig,
}

#[distributed_slice]
pub static REGISTRY: [fn(&SourceContext) -> SourceFactoryResult];

/// Build the fetcher for an entry from the first factory that claims it.
pub fn build_fetcher(ctx: &SourceContext) -> anyhow::Result<Box<dyn Fetcher<Value>>> {
    for factory in REGISTRY {
        if let Some(fetcher) = factory(ctx)? {
            return Ok(fetcher);
        }
    }

    anyhow::bail!(
        "No source available for kind '{}' (entry {})",
        ctx.config.source.kind(),
        ctx.entry_id
    )
}

/// Build an entry's coordinator from config and run its setup.
///
/// Auth failures are reported on `events`.
pub async fn setup_entry(
    entry_id: &str,
    config: &EntryConfig,
    events: EntryEventSender,
) -> anyhow::Result<Entry<Value>> {
    let ctx = SourceContext { entry_id, config };
    let fetcher = build_fetcher(&ctx)?;

    let mut builder = Coordinator::builder(entry_id, fetcher)
        .update_interval(config.update_interval)
        .skip_unchanged(config.skip_unchanged)
        .on_auth_failure(reauth_reporter(entry_id, events));
    if let Some(timeout) = config.fetch_timeout {
        builder = builder.fetch_timeout(timeout);
    }

    let entry = Entry::setup(entry_id, builder.build(), config.scheduler_options())
        .await
        .with_context(|| format!("Failed to set up entry {}", entry_id))?;

    let id = entry_id.to_string();
    entry.add_listener(move |state: &CoordinatorState<Value>| {
        debug!(
            "[{}] State updated (success: {}, phase: {:?})",
            id, state.last_update_success, state.phase
        );
    });

    Ok(entry)
}

/// [`setup_entry`], retried with backoff while the source is not ready.
pub async fn setup_entry_with_retry(
    entry_id: &str,
    config: &EntryConfig,
    events: EntryEventSender,
) -> anyhow::Result<Entry<Value>> {
    retry_setup(entry_id, || setup_entry(entry_id, config, events.clone())).await
}
