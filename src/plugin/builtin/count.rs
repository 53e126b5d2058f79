use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::plugin::{Direction, Interest, Plugin, PluginError, PluginSpec, Verdict};
use crate::relay::{AbortReason, SessionContext};

const LOCK_RETRY: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CountParams {
    limit: u64,
    interval_seconds: f64,
    state_dir: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("qrexec-proxy")
        .join("count")
}

/// Limits how often a chain may be used within a time window
///
/// Every session start is recorded as a unix timestamp, one per line, in a
/// state file named after the chain. The file is shared between proxy
/// processes and guarded by a lock directory next to it.
#[derive(Debug)]
pub struct CountPlugin {
    label: String,
    chain: String,
    limit: u64,
    interval: Duration,
    state_dir: PathBuf,
}

impl CountPlugin {
    pub fn build(spec: &PluginSpec<'_>) -> Result<Arc<dyn Plugin>, ConfigError> {
        let params: CountParams = spec.parse_params()?;
        if params.limit == 0 {
            return Err(spec.invalid("limit must be > 0"));
        }
        if params.interval_seconds <= 0.0 {
            return Err(spec.invalid("intervalSeconds must be > 0"));
        }
        let interval = Duration::try_from_secs_f64(params.interval_seconds)
            .map_err(|e| spec.invalid(e.to_string()))?;

        let state_dir = params.state_dir.unwrap_or_else(default_state_dir);
        std::fs::create_dir_all(&state_dir).map_err(|e| {
            spec.invalid(format!("cannot create state dir {}: {e}", state_dir.display()))
        })?;

        Ok(Arc::new(Self {
            label: spec.label(),
            chain: spec.chain.to_string(),
            limit: params.limit,
            interval,
            state_dir,
        }))
    }

    fn state_file(&self) -> PathBuf {
        self.state_dir.join(&self.chain)
    }

    /// Record this session; `false` if the limit was already reached
    async fn record(&self, now: i64) -> io::Result<bool> {
        let file = self.state_file();
        let content = match tokio::fs::read_to_string(&file).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };

        let window = self.interval.as_secs_f64();
        let mut recent: Vec<i64> = content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .filter(|&t: &i64| ((now - t) as f64) < window)
            .collect();

        let allowed = (recent.len() as u64) < self.limit;
        if allowed {
            recent.push(now);
        }
        debug!(plugin = %self.label, count = recent.len(), allowed, "Counters updated");

        let out: Vec<String> = recent.iter().map(i64::to_string).collect();
        tokio::fs::write(&file, out.join("\n")).await?;
        Ok(allowed)
    }
}

/// Lock held while the state file is read and rewritten.
/// `mkdir` is atomic, so only one process can hold it.
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    async fn acquire(file: &Path, session: &SessionContext) -> io::Result<Option<Self>> {
        let mut path = file.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);

        loop {
            match tokio::fs::create_dir(&path).await {
                Ok(()) => return Ok(Some(Self { path })),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tokio::select! {
                        _ = session.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(LOCK_RETRY) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock");
        }
    }
}

#[async_trait]
impl Plugin for CountPlugin {
    fn kind(&self) -> &'static str {
        "count"
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn interest(&self) -> Interest {
        Interest::None
    }

    async fn on_session_start(&self, session: &SessionContext) -> Result<(), PluginError> {
        let Some(_lock) = DirLock::acquire(&self.state_file(), session).await? else {
            return Ok(());
        };

        if !self.record(chrono::Utc::now().timestamp()).await? {
            info!(plugin = %self.label, limit = self.limit, "Session limit reached");
            session.terminate(AbortReason::PluginTerminated {
                plugin: self.label.clone(),
                reason: format!(
                    "connection limit of {} reached for chain {}",
                    self.limit, self.chain
                ),
            });
        }
        Ok(())
    }

    async fn on_chunk(
        &self,
        _direction: Direction,
        chunk: Bytes,
        _session: &SessionContext,
    ) -> Result<Verdict, PluginError> {
        Ok(Verdict::Forward(chunk))
    }
}
