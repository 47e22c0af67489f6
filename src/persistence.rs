use crate::error::{PacerError, PacerResult};
use crate::metrics::LimiterStats;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Learned state written when a limiter stops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub optimal_rate: f64,
    /// Moving average of response time, in seconds
    pub avg_response_time: Option<f64>,
    /// Seconds since the Unix epoch
    pub last_updated: u64,
    #[serde(default)]
    pub stats: LimiterStats,
}

impl PersistedState {
    pub fn new(optimal_rate: f64, avg_response_time: Option<f64>, stats: LimiterStats) -> Self {
        Self {
            optimal_rate,
            avg_response_time,
            last_updated: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            stats,
        }
    }
}

/// JSON file holding one limiter's learned state
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for `endpoint` under `dir`.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are percent-encoded byte by byte, so
    /// distinct endpoint names never share a file.
    pub fn for_endpoint(dir: &Path, endpoint: &str) -> Self {
        let mut file_name = String::with_capacity(endpoint.len());
        for byte in endpoint.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                file_name.push(byte as char);
            } else {
                file_name.push_str(&format!("%{:02X}", byte));
            }
        }
        Self::new(dir.join(format!("{}.json", file_name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previously saved state, or `None` when there is no usable history.
    ///
    /// A missing or corrupt file is not an error.
    pub fn load(&self) -> Option<PersistedState> {
        match self.try_load() {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring unreadable limiter state");
                None
            }
        }
    }

    pub fn try_load(&self) -> PacerResult<Option<PersistedState>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no prior limiter state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: PersistedState = serde_json::from_str(&raw)?;
        if !state.optimal_rate.is_finite() || state.optimal_rate < 0.0 {
            return Err(PacerError::PersistenceError(format!(
                "stored rate {} is not usable",
                state.optimal_rate
            )));
        }
        if let Some(avg) = state.avg_response_time {
            if avg < 0.0 || Duration::try_from_secs_f64(avg).is_err() {
                return Err(PacerError::PersistenceError(format!(
                    "stored average response time {} is not usable",
                    avg
                )));
            }
        }
        Ok(Some(state))
    }

    /// Write `state`, logging and swallowing any failure
    pub fn save(&self, state: &PersistedState) {
        if let Err(e) = self.try_save(state) {
            warn!(path = %self.path.display(), error = %e, "failed to persist limiter state");
        }
    }

    /// Write through a sibling temp file so readers never see a partial document
    pub fn try_save(&self, state: &PersistedState) -> PacerResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), rate = state.optimal_rate, "persisted limiter state");
        Ok(())
    }
}
