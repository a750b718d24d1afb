//! Process-level configuration.
//!
//! Loaded once at startup from the environment (with an optional `.env` file
//! for local development) and validated before any subsystem starts. A
//! missing required variable is a fatal startup error, not a per-request one.

use anyhow::{bail, Context, Result};
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub jwt_secret: String,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub node_env: String,
}

const DEV_JWT_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let node_env = env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string());
        let is_production = node_env.eq_ignore_ascii_case("production");

        let ws_port = env::var("WS_PORT")
            .unwrap_or_else(|_| "3002".to_string())
            .parse::<u16>()
            .context("WS_PORT must be a valid port number")?;

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ if is_production => {
                bail!("JWT_SECRET is required when NODE_ENV=production")
            }
            _ => {
                tracing::warn!("JWT_SECRET not set, using insecure development default");
                DEV_JWT_SECRET.to_string()
            }
        };

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = env::var("REDIS_URL").ok();

        Ok(Self {
            ws_port,
            jwt_secret,
            database_url,
            redis_url,
            node_env,
        })
    }

    pub fn is_production(&self) -> bool {
        self.node_env.eq_ignore_ascii_case("production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialise tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("NODE_ENV");
        env::remove_var("WS_PORT");
        env::remove_var("JWT_SECRET");
        env::set_var("DATABASE_URL", "test.db");

        let cfg = Config::from_env().expect("config should load with dev defaults");
        assert_eq!(cfg.ws_port, 3002);
        assert_eq!(cfg.jwt_secret, DEV_JWT_SECRET);
        assert!(!cfg.is_production());

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn production_requires_jwt_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("NODE_ENV", "production");
        env::remove_var("JWT_SECRET");
        env::set_var("DATABASE_URL", "test.db");

        let result = Config::from_env();
        assert!(result.is_err());

        env::remove_var("NODE_ENV");
        env::remove_var("DATABASE_URL");
    }
}
