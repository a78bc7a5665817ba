use anyhow::{anyhow, Context, Result};
use doorman_core::oauth::DEFAULT_OAUTH_HOST;
use doorman_core::OAuthSettings;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::state_machine::{Policy, RejoinPolicy};

#[derive(Clone)]
pub struct Config {
    pub telegram_token: String,
    pub ctftime_client_id: String,
    /// Only the API process exchanges codes, so only it requires the secret.
    pub ctftime_client_secret: Option<String>,
    pub ctftime_oauth_host: String,
    pub ctftime_redirect_url: String,
    /// SQLite database file.
    pub database_path: PathBuf,
    pub join_timeout: Duration,
    pub handler_timeout: Duration,
    pub reconcile_interval: Duration,
    pub admin_sync_interval: Duration,
    pub port: u16,
    pub rejoin_policy: RejoinPolicy,
    pub admin_buttons: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from any variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let required = |name: &str| {
            var(name).with_context(|| format!("{} environment variable is required", name))
        };

        let telegram_token = required("TELEGRAM_TOKEN")?;
        let ctftime_client_id = required("CTFTIME_CLIENT_ID")?;
        let ctftime_client_secret = var("CTFTIME_CLIENT_SECRET");

        let ctftime_oauth_host =
            var("CTFTIME_OAUTH_HOST").unwrap_or_else(|| DEFAULT_OAUTH_HOST.to_string());
        let ctftime_redirect_url = var("CTFTIME_REDIRECT_URL")
            .unwrap_or_else(|| "http://localhost:8080/oauth_callback".to_string());

        let database_path = var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("doorman-state.db"));

        let join_timeout = seconds(&var, "JOIN_TIMEOUT_SECS", 600)?;
        let handler_timeout = seconds(&var, "HANDLER_TIMEOUT_SECS", 10)?;
        let reconcile_interval = seconds(&var, "RECONCILE_INTERVAL_SECS", 30)?;
        let admin_sync_interval = seconds(&var, "ADMIN_SYNC_INTERVAL_SECS", 300)?;

        let port = parse_or(&var, "PORT", 8080u16)?;

        let rejoin_policy = match var("REJOIN_POLICY") {
            Some(raw) => raw
                .parse::<RejoinPolicy>()
                .map_err(|e| anyhow!(e))
                .context("REJOIN_POLICY is invalid")?,
            None => RejoinPolicy::default(),
        };
        let admin_buttons = parse_or(&var, "ADMIN_BUTTONS", true)?;

        let debug = parse_or(&var, "DEBUG", false)?;
        let log_level = if debug {
            "debug".to_string()
        } else {
            var("LOG_LEVEL").unwrap_or_else(|| "info".to_string())
        };

        Ok(Config {
            telegram_token,
            ctftime_client_id,
            ctftime_client_secret,
            ctftime_oauth_host,
            ctftime_redirect_url,
            database_path,
            join_timeout,
            handler_timeout,
            reconcile_interval,
            admin_sync_interval,
            port,
            rejoin_policy,
            admin_buttons,
            log_level,
        })
    }

    pub fn policy(&self) -> Policy {
        Policy {
            join_timeout: self.join_timeout,
            rejoin: self.rejoin_policy,
            admin_buttons: self.admin_buttons,
        }
    }

    pub fn oauth_settings(&self) -> OAuthSettings {
        OAuthSettings {
            host: self.ctftime_oauth_host.clone(),
            client_id: self.ctftime_client_id.clone(),
            redirect_url: self.ctftime_redirect_url.clone(),
        }
    }

    /// Admin lists older than this are not trusted for callback checks.
    pub fn admin_max_age(&self) -> Duration {
        self.admin_sync_interval.saturating_mul(3)
    }

    pub fn require_client_secret(&self) -> Result<&str> {
        self.ctftime_client_secret
            .as_deref()
            .context("CTFTIME_CLIENT_SECRET environment variable is required")
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("telegram_token", &"[REDACTED]")
            .field("ctftime_client_id", &self.ctftime_client_id)
            .field(
                "ctftime_client_secret",
                &self.ctftime_client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ctftime_oauth_host", &self.ctftime_oauth_host)
            .field("ctftime_redirect_url", &self.ctftime_redirect_url)
            .field("database_path", &self.database_path)
            .field("join_timeout", &self.join_timeout)
            .field("handler_timeout", &self.handler_timeout)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("admin_sync_interval", &self.admin_sync_interval)
            .field("port", &self.port)
            .field("rejoin_policy", &self.rejoin_policy)
            .field("admin_buttons", &self.admin_buttons)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", name, raw)),
        None => Ok(default),
    }
}

/// Longest accepted interval or timeout: one year.
const MAX_SECONDS: u64 = 365 * 24 * 60 * 60;

fn seconds<F>(var: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let secs = parse_or(var, name, default)?;
    if secs == 0 {
        return Err(anyhow!("{} must be greater than zero", name));
    }
    if secs > MAX_SECONDS {
        return Err(anyhow!(
            "{} must be at most {} seconds, got {}",
            name,
            MAX_SECONDS,
            secs
        ));
    }
    Ok(Duration::from_secs(secs))
}
