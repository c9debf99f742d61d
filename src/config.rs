use std::env;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub clinic_id: Option<Uuid>,
    pub media_dir: PathBuf,
    pub media_public_url: String,
    pub bridge_command: String,
    pub bridge_script: String,
    pub auth_dir: PathBuf,
    pub reconnect_delay: Duration,
    pub logout_restart_delay: Duration,
    pub request_timeout: Duration,
    pub autostart: bool,
    pub run_migrations: bool,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = var_or("BIND_ADDR", "0.0.0.0:3001");

        let clinic_id = match env::var("CLINIC_ID") {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().parse::<Uuid>()?),
            _ => None,
        };

        Ok(Self {
            database_url,
            bind_addr,
            clinic_id,
            media_dir: PathBuf::from(var_or("MEDIA_DIR", "./media")),
            media_public_url: var_or("MEDIA_PUBLIC_URL", "http://localhost:3001/media"),
            bridge_command: var_or("WA_BRIDGE_COMMAND", "node"),
            bridge_script: var_or("WA_BRIDGE_SCRIPT", "./bridge/runner.mjs"),
            auth_dir: PathBuf::from(var_or("WA_AUTH_DIR", "./auth_info_baileys")),
            reconnect_delay: Duration::from_millis(parsed_or("WA_RECONNECT_DELAY_MS", 2000)),
            logout_restart_delay: Duration::from_millis(parsed_or(
                "WA_LOGOUT_RESTART_DELAY_MS",
                2000,
            )),
            request_timeout: Duration::from_secs(parsed_or("WA_REQUEST_TIMEOUT_SECS", 30)),
            autostart: parsed_or("WA_AUTOSTART", true),
            run_migrations: parsed_or("RUN_MIGRATIONS", false),
        })
    }
}
