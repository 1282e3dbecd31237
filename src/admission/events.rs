//! Admission event reporting.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Where admission events go.
///
/// Events always reach `tracing` at debug level. `log_events` raises them to
/// info under the `turnstile::events` target, and `log_file` additionally
/// appends them to a file. A failed append is reported and otherwise ignored;
/// it never changes a decision.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    log_events: bool,
    log_file: Option<PathBuf>,
}

impl EventLog {
    pub fn new(log_events: bool, log_file: Option<PathBuf>) -> Self {
        Self {
            log_events,
            log_file,
        }
    }

    pub async fn record(&self, message: &str) {
        if self.log_events {
            info!(target: "turnstile::events", "{}", message);
        } else {
            debug!(target: "turnstile::events", "{}", message);
        }

        if let Some(path) = &self.log_file {
            let line = format!("{} - {}\n", chrono::Utc::now().to_rfc3339(), message);
            if let Err(e) = append(path, &line).await {
                warn!(path = %path.display(), error = %e, "Failed to append admission event");
            }
        }
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
