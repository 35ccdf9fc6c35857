pub mod config;
pub mod isolation;
pub mod mcp_client;
pub mod server;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

use config::Settings;
use isolation::StdoutGuard;
use mcp_client::Aggregator;
use server::{Dispatcher, SessionEnd};

/// Initialize the tracing subscriber: stderr, or a line-flushing log file.
///
/// stdout is never a log destination. `RUST_LOG` wins over `MCP_LOG_LEVEL`.
pub fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let writer = match &settings.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(FlushingWriter::new(log_file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_directive()));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    let installed = if settings.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %settings
            .log_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<stderr>".into()),
        pid = std::process::id(),
        "=== combine-mcp starting ==="
    );
    Ok(())
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line is on disk immediately, so nothing is lost if the process
/// is killed by its front-end.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => Some(signal),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGTERM handler");
                    None
                }
            };

        let sigterm_recv = async {
            #[cfg(unix)]
            {
                match sigterm.as_mut() {
                    Some(signal) => {
                        signal.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("signal: SIGINT"),
            _ = sigterm_recv => tracing::info!("signal: SIGTERM"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}

/// Run the aggregator until the front-end disconnects or a signal arrives.
///
/// 1. Load the backend list
/// 2. Bring up every backend (failures are logged and skipped)
/// 3. Restore stdout and serve the front-end
/// 4. Shut all backends down
///
/// Fails before serving when the config is invalid or no backend is usable.
pub async fn run(settings: Settings, mut stdout_guard: StdoutGuard) -> anyhow::Result<()> {
    let specs = settings.load_backends()?;
    tracing::info!(servers = specs.len(), "configuration loaded");

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let aggregator = Arc::new(Aggregator::new(settings.supervisor()));
    let report = match aggregator.start_all(&specs, &cancel).await {
        Ok(report) => report,
        Err(e) => {
            aggregator.shutdown().await;
            return Err(e.into());
        }
    };
    let excluded: Vec<&str> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
    tracing::info!(
        ready = ?report.ready,
        ?excluded,
        tools = report.tool_count,
        "aggregator ready"
    );
    if cancel.is_cancelled() {
        tracing::info!("shutdown requested during startup");
        aggregator.shutdown().await;
        return Ok(());
    }

    if stdout_guard.is_engaged() {
        tracing::debug!("restoring stdout for the session");
    }
    stdout_guard.restore().context("restoring stdout")?;

    let dispatcher = Dispatcher::new(Arc::clone(&aggregator), settings.protocol_override.clone());
    let outcome = server::serve(
        &dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        &cancel,
    )
    .await;

    aggregator.shutdown().await;
    match outcome {
        Ok(SessionEnd::Eof) => tracing::info!("front-end disconnected, shut down"),
        Ok(SessionEnd::Cancelled) => tracing::info!("shutdown requested, shut down"),
        Err(e) => return Err(e).context("front-end session failed"),
    }
    Ok(())
}
