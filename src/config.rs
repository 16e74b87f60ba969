use crate::coordinator::{CoordinatorConfig, PeerRegistryConfig, UploadConfig};
use crate::protocol::PeerAddr;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn default_log_level() -> String {
    "info".to_string()
}
fn default_data_dir() -> String {
    "data".to_string()
}
fn default_advertise_addr() -> String {
    "127.0.0.1:4100".to_string()
}
fn default_seed_stagers() -> Vec<String> {
    vec!["127.0.0.1:4000".to_string()]
}
fn default_max_stagers() -> usize {
    3
}
fn default_request_stager_every_secs() -> u64 {
    30
}
fn default_ping_every_secs() -> u64 {
    60
}
fn default_max_missed_pongs() -> u32 {
    // 0 disables eviction.
    3
}
fn default_upload_grant_window_secs() -> u64 {
    10
}
fn default_upload_max_attempts() -> u32 {
    3
}
fn default_upload_retry_backoff_secs() -> u64 {
    30
}
fn default_url_quota_every_secs() -> u64 {
    30
}
fn default_tick_millis() -> u64 {
    500
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_runtime_secs() -> u64 {
    0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub crawler: CrawlerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Holds the instance lock and the per-job dedup files.
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Address sent to stagers in the announce message.
    pub advertise_addr: String,
    pub seed_stagers: Vec<String>,
    pub max_stagers: usize,
    pub request_stager_every_secs: u64,
    pub ping_every_secs: u64,
    pub max_missed_pongs: u32,

    /// How long to keep collecting upload grants after the last one arrived.
    pub upload_grant_window_secs: u64,
    pub upload_max_attempts: u32,
    /// Doubled after every zero-grant round.
    pub upload_retry_backoff_secs: u64,

    pub url_quota_every_secs: u64,
    pub tick_millis: u64,
    pub connect_timeout_secs: u64,
    /// If 0, run until Ctrl-C.
    pub runtime_secs: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            advertise_addr: default_advertise_addr(),
            seed_stagers: default_seed_stagers(),
            max_stagers: default_max_stagers(),
            request_stager_every_secs: default_request_stager_every_secs(),
            ping_every_secs: default_ping_every_secs(),
            max_missed_pongs: default_max_missed_pongs(),

            upload_grant_window_secs: default_upload_grant_window_secs(),
            upload_max_attempts: default_upload_max_attempts(),
            upload_retry_backoff_secs: default_upload_retry_backoff_secs(),

            url_quota_every_secs: default_url_quota_every_secs(),
            tick_millis: default_tick_millis(),
            connect_timeout_secs: default_connect_timeout_secs(),
            runtime_secs: default_runtime_secs(),
        }
    }
}

impl Config {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
    }

    pub fn dedup_dir(&self) -> PathBuf {
        self.data_dir().join("dedup")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("crawler.lock")
    }
}

impl CrawlerConfig {
    pub fn tick_every(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            peers: PeerRegistryConfig {
                advertise_addr: PeerAddr::new(self.advertise_addr.trim()),
                seed_stagers: self
                    .seed_stagers
                    .iter()
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(PeerAddr::new)
                    .collect(),
                max_stagers: self.max_stagers.max(1),
                request_stager_every: Duration::from_secs(self.request_stager_every_secs.max(1)),
                ping_every: Duration::from_secs(self.ping_every_secs.max(1)),
                max_missed_pongs: self.max_missed_pongs,
            },
            upload: UploadConfig {
                grant_window: Duration::from_secs(self.upload_grant_window_secs.max(1)),
                max_attempts: self.upload_max_attempts.max(1),
                retry_backoff: Duration::from_secs(self.upload_retry_backoff_secs.max(1)),
            },
            url_quota_every: Duration::from_secs(self.url_quota_every_secs.max(1)),
        }
    }
}

pub fn init_tracing(config: &Config) {
    // Priority order:
    // 1) RUST_LOG
    // 2) general.log_level
    // 3) info
    //
    // Example:
    // RUST_LOG=info,stager_link::coordinator=trace

    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| config.general.log_level.clone());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .init();
}
