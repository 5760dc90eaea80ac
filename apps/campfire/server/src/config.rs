use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cli::Cli;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: String,
    pub room_ttl_seconds: u64,
    pub public_url: Option<String>,
    pub resume_token_secret: Option<String>,
    pub resume_token_ttl: time::Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(ServerConfig {
            listen_addr,
            redis_url: cli.redis_url,
            room_ttl_seconds: cli.room_ttl_secs,
            public_url: cli.public_url,
            resume_token_secret: cli.resume_token_secret,
            resume_token_ttl: time::Duration::seconds(cli.resume_token_ttl_secs as i64),
            heartbeat_timeout: Duration::from_secs(cli.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}
