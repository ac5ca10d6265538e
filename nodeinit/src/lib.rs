//! Staged initialization and healing of mesh network nodes.
//!
//! A node that joins the network walks an ordered [`catalog::StageCatalog`]
//! of handshake stages. The [`scheduler::SessionScheduler`] runs each stage
//! through a [`transport::NodeTransport`], retries with backoff, persists
//! static results so a restart resumes where it left off, and reports
//! progress as [`events::NodeEvent`]s. Ready nodes periodically re-run the
//! dynamic tail of the catalog through the [`heal::HealCoordinator`].

pub mod catalog;
pub mod db;
pub mod events;
pub mod executor;
pub mod heal;
pub mod metrics;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub use catalog::{Reach, Stage, StageCatalog, StageFlags, StageSpec, StaticData};
pub use events::{EventSink, NodeEvent};
pub use executor::{ExecutionResult, FailureReason};
pub use metrics::SchedulerMetrics;
pub use nodeinit_shared::{
    FunctionId, NodeId, NodeinitError, NodeinitResult, RequestFrame, ResponseFrame,
    TransportError,
};
pub use registry::{NodeRecord, NodeRegistry};
pub use runtime::options::{HealOptions, RuntimeOptions, SchedulerOptions, StageTimeouts};
pub use runtime::{NodeInfo, NodeRuntime, RuntimeParts};
pub use scheduler::{RetryPolicy, SessionScheduler, Step};
pub use session::{NodeMode, NodeSession, NodeSnapshot};
pub use store::{MemoryStaticStore, SqliteStaticStore, StaticDataStore, StoredFailure};
pub use transport::NodeTransport;

const LOGS_DIR: &str = "logs";
const LOG_FILE: &str = "nodeinit.log";

/// Keeps the background log writer alive for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log to `<home_dir>/logs/nodeinit.log`, rotated daily.
///
/// Level comes from `RUST_LOG`, defaulting to `info`. Only the first call in
/// a process installs a subscriber.
pub fn init_logging_for(home_dir: &Path) -> NodeinitResult<()> {
    install_logging(home_dir, false)
}

/// Like [`init_logging_for`], additionally writing to stderr.
pub fn init_logging_with_console(home_dir: &Path) -> NodeinitResult<()> {
    install_logging(home_dir, true)
}

fn install_logging(home_dir: &Path, console: bool) -> NodeinitResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = home_dir.join(LOGS_DIR);
    std::fs::create_dir_all(&logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logs_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = console.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .with(console_layer)
        .try_init();

    let _ = LOG_GUARD.set(guard);
    Ok(())
}
