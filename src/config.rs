use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;

/// Largest ICMP identifier/sequence modulus used for correlation pairs.
pub const MAX_ICMP_IDENTIFIER: u64 = 65535;
pub const DEFAULT_PORT: u16 = 80;
pub const DOMAIN_MAX_LEN: usize = 100;
pub const ICMP_PAYLOAD: &[u8] = b"HELLO-R-U-THERE";

const ICMP_SEND_INTERVAL_LINUX: Duration = Duration::from_millis(1);
const ICMP_SEND_INTERVAL_OTHER: Duration = Duration::from_millis(9);

/// Pause each ICMP sender lane takes after every write.
pub fn icmp_send_interval() -> Duration {
    if cfg!(target_os = "linux") {
        ICMP_SEND_INTERVAL_LINUX
    } else {
        ICMP_SEND_INTERVAL_OTHER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ProbeType {
    Tcp,
    Icmp,
    Http,
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeType::Tcp => "tcp",
            ProbeType::Icmp => "icmp",
            ProbeType::Http => "http",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShowMode {
    Table,
    Waterfall,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Where the destinations come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
    Single(String),
    File { path: PathBuf, loose: bool },
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub source: TargetSource,
    pub port: u16,
    pub src_ip: Option<IpAddr>,
    pub probe_type: ProbeType,
    pub timeout: Duration,
    pub concurrency: usize,
    /// Passes over every target; 0 runs rounds until cancelled.
    pub repeat: u32,
    pub show_mode: ShowMode,
    pub domain_a: bool,
    pub log_level: LogLevel,
}

impl ProbeConfig {
    pub fn is_continuous(&self) -> bool {
        self.repeat == 0
    }

    /// Label shown in the target column of the tables.
    pub fn instance_name(&self) -> String {
        match &self.source {
            TargetSource::File { path, .. } => path.display().to_string(),
            TargetSource::Single(target) => match self.probe_type {
                ProbeType::Tcp => format!("{}|{}", target, self.port),
                ProbeType::Icmp | ProbeType::Http => target.clone(),
            },
        }
    }
}
