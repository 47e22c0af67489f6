use envconfig::Envconfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Directory for learned-rate state files, empty disables persistence
    #[envconfig(from = "PACER_STATE_DIR", default = "")]
    pub state_dir: String,

    /// Optional JSON file with per-endpoint limiter rules
    #[envconfig(from = "PACER_ENDPOINTS_FILE", default = "")]
    pub endpoints_file: String,

    /// Pause between two drain sweeps, in milliseconds
    #[envconfig(from = "PACER_IDLE_DELAY_MS", default = "10")]
    pub idle_delay_ms: u64,

    #[envconfig(from = "PACER_LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: String::new(),
            endpoints_file: String::new(),
            idle_delay_ms: 10,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        non_empty_path(&self.state_dir)
    }

    pub fn endpoints_file(&self) -> Option<PathBuf> {
        non_empty_path(&self.endpoints_file)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms.max(1))
    }
}

fn non_empty_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}
