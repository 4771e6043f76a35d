use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use dotenv::dotenv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(anyhow!("STORE_BACKEND must be memory or postgres (got '{}')", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub server_host: String,
    pub server_port: u16,

    // Storage
    pub store_backend: StoreBackend,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_max_connections: u32,

    // Auth
    pub jwt_secret: String,

    // Sync
    pub uploads_prefix: String,
    pub resync_interval_secs: u64,
    pub broadcast_capacity: usize,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn new() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            // Server
            server_host: var_or("SERVER_HOST", "127.0.0.1"),
            server_port: parsed_or("SERVER_PORT", 5500),

            // Storage
            store_backend: var_or("STORE_BACKEND", "memory").parse()?,
            db_host: var_or("DB_HOST", "localhost"),
            db_port: parsed_or("DB_PORT", 5432),
            db_user: var_or("DB_USER", "postgres"),
            db_password: var_or("DB_PASSWORD", "postgres"),
            db_name: var_or("DB_NAME", "group_locations"),
            db_max_connections: parsed_or("DB_MAX_CONNECTIONS", 5),

            // Auth
            jwt_secret: env::var("JWT_SECRET").map_err(|_| anyhow!("JWT_SECRET must be set"))?,

            // Sync
            uploads_prefix: var_or("UPLOADS_PREFIX", "/uploads"),
            resync_interval_secs: parsed_or("RESYNC_INTERVAL_SECS", 30),
            broadcast_capacity: parsed_or("BROADCAST_CAPACITY", 64),
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn database_url(&self) -> String {
        if let Ok(url) = env::var("DATABASE_URL") {
            url
        } else {
            format!(
                "postgresql://{}:{}@{}:{}/{}",
                self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
            )
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_backend_parses_case_insensitively() {
        assert_eq!("Memory".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert_eq!("postgresql".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert!("mongo".parse::<StoreBackend>().is_err());
    }
}
