//! Shared tracing bootstrap (feature `tracing-init`): env-filter fmt layer,
//! optional daily-rotated file appender under `$XDG_STATE_HOME/<app>/logs`.

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Resolves the log directory: `$XDG_STATE_HOME/<app>/logs` or `~/.local/state/<app>/logs`.
fn log_dir(app_name: &str) -> Option<PathBuf> {
    if let Ok(state) = std::env::var("XDG_STATE_HOME") {
        if !state.trim().is_empty() {
            return Some(PathBuf::from(state).join(app_name).join("logs"));
        }
    }
    dirs::home_dir().map(|h| h.join(".local/state").join(app_name).join("logs"))
}

/// Installs the global subscriber: stderr fmt layer filtered by `RUST_LOG`
/// (default `info`), plus a daily file appender when the log directory is
/// writable. Returns the appender guard; keep it alive for the process
/// lifetime or buffered lines are lost.
pub fn init_tracing(app_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = log_dir(app_name)
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| tracing_appender::rolling::daily(dir, format!("{app_name}.log")))
        .map(tracing_appender::non_blocking);

    match file_layer {
        Some((writer, guard)) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init();
            None
        }
    }
}
