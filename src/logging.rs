//! Logging configuration for Pinakes.
//!
//! Console output goes through a [`LogRouter`]: while a progress display is
//! installed, log lines are printed above the live bars instead of tearing
//! through them. The router is created in `main` and handed to whichever
//! component owns the terminal.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;

use indicatif::MultiProgress;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::Result;

/// Injected console sink. Cloning shares the same routing state.
#[derive(Clone, Default)]
pub struct LogRouter {
    progress: Arc<RwLock<Option<MultiProgress>>>,
}

impl LogRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route console log lines through the given progress display.
    pub fn install(&self, progress: MultiProgress) {
        if let Ok(mut guard) = self.progress.write() {
            *guard = Some(progress);
        }
    }

    /// Restore plain stderr output. Safe to call more than once.
    pub fn restore(&self) {
        if let Ok(mut guard) = self.progress.write() {
            guard.take();
        }
    }

    fn snapshot(&self) -> Option<MultiProgress> {
        self.progress.read().ok().and_then(|g| g.clone())
    }
}

impl<'a> MakeWriter<'a> for LogRouter {
    type Writer = RouterWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RouterWriter {
            progress: self.snapshot(),
            buf: Vec::with_capacity(256),
        }
    }
}

/// One-shot writer produced per log event.
pub struct RouterWriter {
    progress: Option<MultiProgress>,
    buf: Vec<u8>,
}

impl Write for RouterWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&self.buf);
        match &self.progress {
            Some(mp) => {
                let _ = mp.println(line.trim_end());
            }
            None => {
                let mut err = std::io::stderr().lock();
                err.write_all(self.buf.as_slice())?;
            }
        }
        self.buf.clear();
        Ok(())
    }
}

impl Drop for RouterWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Initialize tracing with console output through `router` and a daily
/// rolling file under `logs/`.
///
/// # Errors
/// Returns an error if the `logs` directory cannot be created.
pub fn init_logging(verbose: bool, router: LogRouter) -> Result<()> {
    let logs_dir = Path::new("logs");
    if !logs_dir.exists() {
        std::fs::create_dir_all(logs_dir)?;
    }

    let level = if verbose { "debug" } else { "info" };
    // Suppress third-party noise; sqlx=error disables statement logging.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,pinakes={level},sqlx=error,hyper=warn,reqwest=warn,ort=warn"
        ))
    });

    let file_appender = tracing_appender::rolling::daily("logs", "pinakes.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(router)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
            if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::INFO
            },
        ));

    let file_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NONE)
        .with_writer(non_blocking)
        .with_ansi(false);

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the appender guard alive for the process lifetime.
    std::mem::forget(guard);

    tracing::debug!("Logging initialized with level: {level}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_is_idempotent() {
        let router = LogRouter::new();
        router.install(MultiProgress::new());
        router.restore();
        router.restore();
        assert!(router.snapshot().is_none());
    }
}
