//! The data plane and driver: per-edge record buffers, the barrier-level
//! `execute` scheduler, and the `|`-chainable segment builder that compiles
//! down to a [`Graph`].

mod buffer;
mod graph;
mod scheduler;
mod segment;

pub use buffer::EdgeBuffer;
pub use graph::{Edge, Graph, GraphBuildError, PumpReport};
pub use scheduler::{ExecutionReport, Scheduler};
pub use segment::Segment;

/// Initialize `tracing` for a standalone binary: an `EnvFilter` read from
/// `BATCHFACTORY_LOG` if set, falling back to `RUST_LOG`, defaulting to
/// `info`. Library consumers that embed this engine in their own binary are
/// free to set up `tracing-subscriber` themselves instead.
pub fn init_tracing() {
    let filter = std::env::var("BATCHFACTORY_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
        .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
