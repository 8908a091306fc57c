use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Installs the global subscriber: console output filtered by `RUST_LOG` (default `info`),
/// plus a daily rolling file under `logs_dir` when `HOMEHELPER_LOG_ROLL=1`.
pub fn init(logs_dir: &Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_filter(filter);
    let registry = tracing_subscriber::registry().with(console);

    if std::env::var("HOMEHELPER_LOG_ROLL").ok().as_deref() == Some("1") {
        if std::fs::create_dir_all(logs_dir).is_err() {
            eprintln!("failed to create log directory {}", logs_dir.display());
        }
        let prefix =
            std::env::var("HOMEHELPER_LOG_PREFIX").unwrap_or_else(|_| "homehelper".into());
        let writer = tracing_appender::rolling::daily(logs_dir, prefix);
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let file_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(file_filter);
        let _ = registry.with(file_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
