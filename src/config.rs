use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, resolved once from the environment. Mirrors
/// the `storage::data_dir()` home-directory resolution, generalized
/// into a single config object instead of scattered free functions.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub sync_url: Option<String>,
    pub sync_key: Option<String>,
    pub save_debounce: Duration,
    pub archive_days_threshold: i64,
    pub network_timeout: Duration,
    pub network_retries: u32,
    pub network_backoff_base: Duration,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            sync_url: std::env::var("ASKESIS_SYNC_URL").ok(),
            sync_key: std::env::var("ASKESIS_SYNC_KEY").ok(),
            save_debounce: Duration::from_millis(500),
            archive_days_threshold: 90,
            network_timeout: Duration::from_secs(15),
            network_retries: 2,
            network_backoff_base: Duration::from_millis(500),
            max_upload_bytes: 4 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("ASKESIS_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg
    }
}

/// Resolve the user's home directory reliably, falling back through
/// `$HOME`/`$USERPROFILE`.
fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".askesis")
}

pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("askesis_core=info,warn"))
        .format_timestamp_millis()
        .try_init()
        .ok();
}
