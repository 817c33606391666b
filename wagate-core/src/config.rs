//! Engine tunables, collected from environment variables with defaults.
//! The binary-level settings (bind address, database URL, log level) are
//! clap arguments in `wagate-server`.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::broadcast::BroadcastDefaults;
use crate::dispatch::DispatchConfig;
use crate::ratelimit::RateLimitConfig;
use crate::scraper::ScraperConfig;
use crate::sessions::{ReconnectPolicy, SessionManagerConfig};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub session_storage_path: PathBuf,
    pub qr_ttl: Duration,
    pub rate: RateLimitConfig,
    pub broadcast: BroadcastDefaults,
    pub dispatch: DispatchConfig,
    pub scraper: ScraperConfig,
    pub cors_origins: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let session_storage_path = env::var("WAGATE_SESSION_STORAGE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sessions"));
        let qr_ttl_secs = env::var("WAGATE_QR_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60u64);
        let cors_origins = env::var("WAGATE_CORS_ORIGINS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            session_storage_path,
            qr_ttl: Duration::from_secs(qr_ttl_secs),
            rate: RateLimitConfig::from_env(),
            broadcast: BroadcastDefaults::from_env(),
            dispatch: DispatchConfig::default(),
            scraper: ScraperConfig::from_env(),
            cors_origins,
        }
    }

    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            storage_path: self.session_storage_path.clone(),
            qr_ttl: self.qr_ttl,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_storage_path: PathBuf::from("./sessions"),
            qr_ttl: Duration::from_secs(60),
            rate: RateLimitConfig::default(),
            broadcast: BroadcastDefaults::default(),
            dispatch: DispatchConfig::default(),
            scraper: ScraperConfig::default(),
            cors_origins: Vec::new(),
        }
    }
}
