//! livetl: live translation pipeline for short, frequently changing UI text.
//! Deduplicating queue, LRU result cache, batched backend calls and
//! liveness-tracked callback delivery, behind one `Pipeline` handle.

pub mod batch;
pub mod config;
pub mod handles;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod state_machine;
pub mod translate;

pub use config::{BackendConfig, ConfigError, FilterConfig, PipelineConfig, RetryPolicy};
pub use handles::{ContainerId, HandleId, TextConsumer};
pub use pipeline::{CycleReport, Pipeline, SubmitOutcome};
pub use state_machine::{PipelineState, PipelineStatus};
pub use translate::{TranslateError, TranslationBackend};

/// Install the fmt subscriber (`RUST_LOG` overrides the default filter).
/// Set `LIVETL_LOG_JSON=1` for JSON lines. Later calls are ignored.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("livetl=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let json = std::env::var("LIVETL_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
