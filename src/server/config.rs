use std::env;
use std::time::Duration;

use anyhow::bail;

/// Minimum length for the token signing key; shorter keys are a config error.
pub const MIN_SECRET_KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_address: String,
    pub database_url: String,
    pub redis_address: String,
    pub token_symmetric_key: String,
    pub access_token_duration: Duration,
    pub refresh_token_duration: Duration,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let token_symmetric_key = match env::var("TOKEN_SYMMETRIC_KEY") {
            Ok(k) => k,
            Err(_) => bail!("TOKEN_SYMMETRIC_KEY is not set"),
        };
        if token_symmetric_key.len() < MIN_SECRET_KEY_LEN {
            bail!(
                "TOKEN_SYMMETRIC_KEY must be at least {} characters",
                MIN_SECRET_KEY_LEN
            );
        }

        Ok(Self {
            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8081".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/crosspath.db".to_string()),
            redis_address: env::var("REDIS_ADDRESS")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            token_symmetric_key,
            access_token_duration: duration_var("ACCESS_TOKEN_DURATION_SECONDS", 15 * 60),
            refresh_token_duration: duration_var("REFRESH_TOKEN_DURATION_SECONDS", 7 * 24 * 3600),
        })
    }
}

fn duration_var(key: &str, default_secs: u64) -> Duration {
    let secs = env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}
