use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::{DEFAULT_PORT, DOMAIN_MAX_LEN, LogLevel, ProbeConfig, ProbeType, ShowMode, TargetSource};
use crate::error::{ProbeError, Result};
use crate::target;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Fire TCP, HTTP or ICMP probes at many targets and track their fail rate."
)]
pub struct CliArgs {
    /// Destination: IP address, CIDR block or domain name
    #[clap(short = 'd', long, conflicts_with = "dst_file")]
    pub dst_target: Option<String>,

    /// Destination port for TCP and HTTP probes
    #[clap(short = 'p', long, default_value_t = DEFAULT_PORT, value_parser = clap::value_parser!(u16).range(1..=65534))]
    pub dst_port: u16,

    /// File with one destination per line, optionally followed by a port
    #[clap(short = 'f', long)]
    pub dst_file: Option<PathBuf>,

    /// Skip malformed lines in the target file instead of aborting
    #[clap(short = 'L', long)]
    pub dst_file_loose: bool,

    /// Source address to send probes from
    #[clap(short = 's', long)]
    pub src_ip: Option<IpAddr>,

    /// Probe protocol; icmp needs raw socket privileges
    #[clap(short = 't', long, value_enum, default_value_t = ProbeType::Tcp)]
    pub ping_type: ProbeType,

    /// Per-probe timeout in seconds
    #[clap(short = 'm', long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..=10))]
    pub ping_timeout: u64,

    /// Number of concurrent worker lanes
    #[clap(short = 'c', long, default_value_t = 11, value_parser = clap::value_parser!(u16).range(1..=99))]
    pub ping_concurrency: u16,

    /// Probes per target; 0 probes in rounds until interrupted
    #[clap(short = 'n', long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(0..=100_000))]
    pub ping_number: u32,

    /// Output style; continuous runs always use the table
    #[clap(short = 'o', long, value_enum, default_value_t = ShowMode::Table)]
    pub show_mode: ShowMode,

    /// Probe every address record of the destination domain
    #[clap(short = 'a', long)]
    pub domain_a: bool,

    /// Log verbosity; RUST_LOG takes precedence
    #[clap(short = 'l', long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl CliArgs {
    pub fn into_config(self) -> Result<ProbeConfig> {
        if self.show_mode == ShowMode::Json {
            return Err(ProbeError::config("JSON output is not supported yet"));
        }

        let source = match (self.dst_target, self.dst_file) {
            (Some(destination), _) => {
                validate_destination(&destination)?;
                TargetSource::Single(destination)
            }
            (None, Some(path)) => {
                if !path.is_file() {
                    return Err(ProbeError::config(format!(
                        "target file {} does not exist",
                        path.display()
                    )));
                }
                TargetSource::File {
                    path,
                    loose: self.dst_file_loose,
                }
            }
            (None, None) => return Err(ProbeError::NoTasks),
        };

        Ok(ProbeConfig {
            source,
            port: self.dst_port,
            src_ip: self.src_ip,
            probe_type: self.ping_type,
            timeout: Duration::from_secs(self.ping_timeout),
            concurrency: usize::from(self.ping_concurrency),
            repeat: self.ping_number,
            show_mode: self.show_mode,
            domain_a: self.domain_a,
            log_level: self.log_level,
        })
    }
}

fn validate_destination(destination: &str) -> Result<()> {
    if target::is_ip(destination) || target::is_cidr(destination) {
        return Ok(());
    }
    if !target::is_dns_name(destination) {
        return Err(ProbeError::invalid_target(
            destination,
            "expected an IP address, CIDR block or domain name",
        ));
    }
    if destination.len() > DOMAIN_MAX_LEN {
        return Err(ProbeError::invalid_target(
            destination,
            format!("domain names are limited to {DOMAIN_MAX_LEN} characters"),
        ));
    }
    Ok(())
}
