use clap::{Args, Parser, Subcommand};

use crate::config::ServiceKind;
use crate::heartbeat::DeviceType;

#[derive(Debug, Parser)]
#[command(
    name = "relay-broker",
    author,
    version,
    about = "Per-device session broker for robot sensing services"
)]
pub struct Cli {
    /// Tracing filter directives, e.g. `info,relay_broker=debug`.
    #[arg(long, env = "RELAY_LOG", default_value = "info", global = true)]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one broker until interrupted.
    Serve(ServeArgs),
    /// Act as a device: keep a heartbeat fresh and re-announce the identifier.
    Announce(AnnounceArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Redis connection URI used for the bus and the store.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Which capability sessions of this broker host.
    #[arg(long, env = "RELAY_SERVICE", value_enum)]
    pub service: ServiceKind,

    /// Registration channel (exact name or glob); defaults per service.
    #[arg(long, env = "RELAY_REGISTRATION_CHANNEL")]
    pub registration_channel: Option<String>,

    /// Heartbeat age after which a device counts as gone.
    #[arg(long, env = "RELAY_STALE_AFTER_SECS", default_value_t = 60)]
    pub stale_after_secs: u64,

    /// Delay between liveness checks.
    #[arg(long, env = "RELAY_POLL_INTERVAL_MS", default_value_t = 60_100)]
    pub poll_interval_ms: u64,

    /// Concurrent non-control handlers per session.
    #[arg(long, env = "RELAY_MAX_IN_FLIGHT", default_value_t = 16)]
    pub max_in_flight: usize,

    /// Command run per frame or transcript; results are read from its stdout.
    #[arg(long, env = "RELAY_COLLABORATOR")]
    pub collaborator: Option<String>,

    #[arg(long, env = "RELAY_COLLABORATOR_TIMEOUT_SECS", default_value_t = 30)]
    pub collaborator_timeout_secs: u64,
}

#[derive(Debug, Args)]
pub struct AnnounceArgs {
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Identifier to announce, `<user>-<device>`.
    #[arg(long)]
    pub identifier: String,

    #[arg(long, default_value = "cam")]
    pub device_type: DeviceType,

    /// Channel the identifier is published on each cycle.
    #[arg(long)]
    pub registration_channel: String,

    #[arg(long, default_value_t = 59_900)]
    pub interval_ms: u64,
}
