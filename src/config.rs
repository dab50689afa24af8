//! Process configuration, read once at start from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Scheduler configuration loaded from `SWITCHBACK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address
    pub http_addr: SocketAddr,

    /// Global cap on concurrently executing jobs
    pub max_workers: usize,

    /// Cap on tenants with active work
    pub max_active_users: usize,

    /// Bounded mailbox size per event subscriber
    pub event_mailbox_size: usize,

    /// Sliding window for the dashboard latency average
    pub latency_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_addr: "127.0.0.1:8000".parse().expect("static addr"),
            max_workers: 10,
            max_active_users: 3,
            event_mailbox_size: 64,
            latency_window: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let http_addr: SocketAddr = std::env::var("SWITCHBACK_HTTP_ADDR")
            .unwrap_or_else(|_| defaults.http_addr.to_string())
            .parse()?;

        let max_workers = env_usize("SWITCHBACK_MAX_WORKERS", defaults.max_workers)?;
        let max_active_users =
            env_usize("SWITCHBACK_MAX_ACTIVE_USERS", defaults.max_active_users)?;
        let event_mailbox_size =
            env_usize("SWITCHBACK_EVENT_MAILBOX_SIZE", defaults.event_mailbox_size)?;
        let latency_window_seconds = env_usize("SWITCHBACK_LATENCY_WINDOW_SECONDS", 60)?;

        if max_workers == 0 {
            anyhow::bail!("SWITCHBACK_MAX_WORKERS must be at least 1");
        }
        if max_active_users == 0 {
            anyhow::bail!("SWITCHBACK_MAX_ACTIVE_USERS must be at least 1");
        }

        Ok(Config {
            http_addr,
            max_workers,
            max_active_users,
            event_mailbox_size,
            latency_window: Duration::from_secs(latency_window_seconds as u64),
        })
    }
}

fn env_usize(name: &str, default: usize) -> anyhow::Result<usize> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be an integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.max_active_users, 3);
        assert_eq!(config.event_mailbox_size, 64);
        assert_eq!(config.latency_window, Duration::from_secs(60));
    }
}
