//! Usage: Process configuration from flags or environment variables.

use clap::Parser;
use std::net::SocketAddr;

#[derive(Debug, Clone, Parser)]
#[command(name = "sybil-gateway", version, about = "Authenticated inference gateway")]
pub struct Config {
    /// Writable SQLite database path.
    #[arg(long, env = "DSN")]
    pub dsn: String,

    /// SQLite database opened read-only for caller and model lookups.
    #[arg(long, env = "READ_DSN")]
    pub read_dsn: String,

    /// Full cache address; wins over host/port when set.
    #[arg(long, env = "REDIS_ADDR")]
    pub redis_addr: Option<String>,

    #[arg(long, env = "REDIS_HOST", default_value = "cache")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    #[arg(long, env = "METRICS_API_KEY")]
    pub metrics_api_key: String,

    /// Upstream inference hub, `host:port` or a full URL.
    #[arg(long, env = "FALLBACK_SERVER")]
    pub fallback_server: String,

    #[arg(long, env = "FALLBACK_SERVER_API_KEY")]
    pub fallback_server_api_key: String,

    /// Error-report sink; reports are only logged without it.
    #[arg(long, env = "ENDON_URL")]
    pub endon_url: Option<String>,

    #[arg(long, env = "DEBUG", default_value_t = false, action = clap::ArgAction::Set)]
    pub debug: bool,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:80")]
    pub listen_addr: SocketAddr,
}

impl Config {
    pub fn redis_addr(&self) -> String {
        match self.redis_addr.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => format!("{}:{}", self.redis_host, self.redis_port),
        }
    }
}
