//! Destination classification and expansion into probe tasks.

use std::io;
use std::net::IpAddr;
use std::time::Duration;

use dns_lookup::lookup_host;
use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use crate::config::ProbeType;
use crate::error::{ProbeError, Result};
use crate::task::ProbeTask;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
/// Largest block (in host bits) a single CIDR destination may expand to.
const MAX_CIDR_HOST_BITS: u8 = 24;

/// Parameters copied onto every expanded task.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    pub probe_type: ProbeType,
    pub src_ip: Option<IpAddr>,
    pub timeout: Duration,
    /// Resolve domains up front into one task per address record.
    pub domain_a: bool,
}

pub fn is_ip(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok()
}

pub fn is_cidr(value: &str) -> bool {
    value.contains('/') && value.parse::<IpNetwork>().is_ok()
}

/// Hostname check: dot-separated labels of letters, digits, `_` and `-`,
/// each starting with a letter, digit or `_`, with an optional trailing dot.
pub fn is_dns_name(value: &str) -> bool {
    if value.is_empty() || value.replace('.', "").len() > MAX_NAME_LEN || is_ip(value) {
        return false;
    }
    let name = value.strip_suffix('.').unwrap_or(value);
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|label| {
        let mut chars = label.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphanumeric() || first == '_' => {}
            _ => return false,
        }
        label.len() <= MAX_LABEL_LEN
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// True when `value` is any destination shape the expander understands.
pub fn is_destination(value: &str) -> bool {
    is_ip(value) || is_cidr(value) || is_dns_name(value)
}

/// Expands one destination into task skeletons.
///
/// Classification order is IP literal, CIDR block, DNS name. A destination
/// matching none of them yields an empty list; an oversized block is a
/// configuration error.
pub fn expand(destination: &str, port: u16, opts: &ExpandOptions) -> Result<Vec<ProbeTask>> {
    let task = |target: String| ProbeTask::new(target, port, opts.probe_type, opts.src_ip, opts.timeout);

    if is_ip(destination) {
        return Ok(vec![task(destination.to_string())]);
    }

    if is_cidr(destination) {
        let network: IpNetwork = destination
            .parse()
            .map_err(|_| ProbeError::invalid_target(destination, "unparsable network"))?;
        let max_prefix = match network {
            IpNetwork::V4(_) => 32,
            IpNetwork::V6(_) => 128,
        };
        if max_prefix - network.prefix() > MAX_CIDR_HOST_BITS {
            return Err(ProbeError::invalid_target(
                destination,
                format!("network is larger than /{}", max_prefix - MAX_CIDR_HOST_BITS),
            ));
        }
        return Ok(network.iter().map(|ip| task(ip.to_string())).collect());
    }

    if is_dns_name(destination) {
        if !opts.domain_a {
            return Ok(vec![task(destination.to_string())]);
        }
        return Ok(match resolve_all(destination) {
            Ok(addrs) => {
                debug!(domain = destination, count = addrs.len(), "resolved address records");
                addrs.into_iter().map(|ip| task(ip.to_string())).collect()
            }
            Err(err) => {
                warn!(domain = destination, error = %err, "address lookup failed");
                Vec::new()
            }
        });
    }

    Ok(Vec::new())
}

/// Rewrites HTTP task targets to `http://host:port`.
pub fn render_http(tasks: &mut [ProbeTask]) {
    for task in tasks.iter_mut() {
        task.target = http_url(&task.target, task.port);
    }
}

pub fn http_url(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("http://[{ip}]:{port}"),
        _ => format!("http://{host}:{port}"),
    }
}

/// Every address the resolver returns for `host`, duplicates removed,
/// resolver order kept.
pub fn resolve_all(host: &str) -> io::Result<Vec<IpAddr>> {
    let mut addrs: Vec<IpAddr> = Vec::new();
    for addr in lookup_host(host)? {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    Ok(addrs)
}

/// Address an ICMP probe for `target` is sent to. Literals are used as-is;
/// names resolve to their first IPv4 address.
pub fn resolve_host(target: &str) -> io::Result<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }
    resolve_all(target)?
        .into_iter()
        .find(IpAddr::is_ipv4)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no IPv4 address for {target}")))
}
