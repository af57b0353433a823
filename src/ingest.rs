//! Target file parsing.
//!
//! One destination per line, optionally followed by a port. Strict mode
//! rejects the whole file on the first malformed line; loose mode drops
//! such lines silently.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::config::ProbeType;
use crate::error::{ProbeError, Result};
use crate::target::{self, ExpandOptions};
use crate::task::ProbeTask;

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub expand: ExpandOptions,
    /// Port for single-field lines.
    pub default_port: u16,
    pub loose: bool,
}

pub fn load_target_file(path: &Path, opts: &IngestOptions) -> Result<Vec<ProbeTask>> {
    let content = fs::read_to_string(path)?;
    let tasks = parse_targets(&content, opts)?;
    info!(file = %path.display(), tasks = tasks.len(), "loaded target file");
    Ok(tasks)
}

pub fn parse_targets(content: &str, opts: &IngestOptions) -> Result<Vec<ProbeTask>> {
    let mut tasks = Vec::new();
    let mut seen = HashSet::new();

    for (index, raw) in content.split('\n').enumerate() {
        let line_no = index + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let (destination, port) = match fields.as_slice() {
            [destination] => {
                if !opts.loose {
                    check_single_field(destination, opts, line_no)?;
                }
                (*destination, opts.default_port)
            }
            [destination, port] => {
                if !opts.loose {
                    check_two_fields(destination, port, opts, line_no)?;
                }
                match port.parse::<u16>() {
                    Ok(port) => (*destination, port),
                    Err(_) => {
                        debug!(line = line_no, "skipping line with unparsable port");
                        continue;
                    }
                }
            }
            _ => {
                if !opts.loose {
                    return Err(ProbeError::FileFormat { line: line_no });
                }
                debug!(line = line_no, "skipping line with too many fields");
                continue;
            }
        };

        if opts.expand.domain_a && !target::is_dns_name(destination) {
            continue;
        }

        let mut expanded = target::expand(destination, port, &opts.expand)?;
        if opts.expand.probe_type == ProbeType::Http {
            target::render_http(&mut expanded);
        }
        for task in expanded {
            if seen.insert(task.key()) {
                tasks.push(task);
            }
        }
    }

    Ok(tasks)
}

fn check_single_field(destination: &str, opts: &IngestOptions, line: usize) -> Result<()> {
    let valid = opts.expand.probe_type == ProbeType::Icmp
        && target::is_destination(destination)
        && (!opts.expand.domain_a || target::is_dns_name(destination));
    if valid {
        Ok(())
    } else {
        Err(ProbeError::FileFormat { line })
    }
}

// A port column is rejected for ICMP here even though the single-target
// command line accepts one.
fn check_two_fields(destination: &str, port: &str, opts: &IngestOptions, line: usize) -> Result<()> {
    let valid = opts.expand.probe_type != ProbeType::Icmp
        && target::is_destination(destination)
        && !port.is_empty()
        && port.chars().all(|c| c.is_ascii_digit())
        && port.parse::<u16>().is_ok()
        && (!opts.expand.domain_a || target::is_dns_name(destination));
    if valid {
        Ok(())
    } else {
        Err(ProbeError::FileFormat { line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn opts(probe_type: ProbeType, loose: bool) -> IngestOptions {
        IngestOptions {
            expand: ExpandOptions {
                probe_type,
                src_ip: None,
                timeout: Duration::from_secs(1),
                domain_a: false,
            },
            default_port: 80,
            loose,
        }
    }

    fn keys(tasks: &[ProbeTask]) -> Vec<String> {
        tasks.iter().map(ProbeTask::key).collect()
    }

    #[test]
    fn strict_tcp_reads_host_and_port_lines() {
        let content = "10.0.0.1 22\n\n  example.com   443  \n10.0.0.0/31 80\n";
        let tasks = parse_targets(content, &opts(ProbeType::Tcp, false)).unwrap();
        assert_eq!(
            keys(&tasks),
            vec!["10.0.0.1|22", "example.com|443", "10.0.0.0|80", "10.0.0.1|80"]
        );
    }

    #[test]
    fn strict_rejects_three_fields_with_line_number() {
        let content = "10.0.0.1 22\n10.0.0.2 22 extra\n";
        let err = parse_targets(content, &opts(ProbeType::Tcp, false)).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 2 }));
    }

    #[test]
    fn loose_skips_three_fields() {
        let content = "10.0.0.1 22\n10.0.0.2 22 extra\n10.0.0.3 22\n";
        let tasks = parse_targets(content, &opts(ProbeType::Tcp, true)).unwrap();
        assert_eq!(keys(&tasks), vec!["10.0.0.1|22", "10.0.0.3|22"]);
    }

    #[test]
    fn strict_tcp_requires_port_column() {
        let err = parse_targets("10.0.0.1\n", &opts(ProbeType::Tcp, false)).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 1 }));
    }

    #[test]
    fn strict_icmp_rejects_port_column() {
        // Deliberate asymmetry: a port column is refused for ICMP in strict
        // files even though the single-target path tolerates a port.
        let err = parse_targets("10.0.0.1\n10.0.0.2 80\n", &opts(ProbeType::Icmp, false)).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 2 }));

        let tasks = parse_targets("10.0.0.1\n10.0.0.2 80\n", &opts(ProbeType::Icmp, true)).unwrap();
        assert_eq!(keys(&tasks), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn strict_rejects_non_numeric_port() {
        let err = parse_targets("10.0.0.1 http\n", &opts(ProbeType::Http, false)).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 1 }));
    }

    #[test]
    fn loose_drops_unparsable_port_and_uses_default_port() {
        let content = "10.0.0.1 http\n10.0.0.2\n";
        let tasks = parse_targets(content, &opts(ProbeType::Tcp, true)).unwrap();
        assert_eq!(keys(&tasks), vec!["10.0.0.2|80"]);
    }

    #[test]
    fn port_beyond_u16_is_a_format_error() {
        let content = "10.0.0.1 70000\n10.0.0.2 65535\n";
        let err = parse_targets(content, &opts(ProbeType::Tcp, false)).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 1 }));

        let tasks = parse_targets(content, &opts(ProbeType::Tcp, true)).unwrap();
        assert_eq!(keys(&tasks), vec!["10.0.0.2|65535"]);
    }

    #[test]
    fn deduplicates_across_lines() {
        let content = "10.0.0.1 80\n10.0.0.0/30 80\n10.0.0.1 81\n";
        let tasks = parse_targets(content, &opts(ProbeType::Tcp, false)).unwrap();
        assert_eq!(
            keys(&tasks),
            vec!["10.0.0.1|80", "10.0.0.0|80", "10.0.0.2|80", "10.0.0.3|80", "10.0.0.1|81"]
        );

        let icmp = parse_targets("10.0.0.1\n10.0.0.1\n10.0.0.0/31\n", &opts(ProbeType::Icmp, false)).unwrap();
        assert_eq!(keys(&icmp), vec!["10.0.0.1", "10.0.0.0"]);
    }

    #[test]
    fn http_targets_are_rendered_before_dedup() {
        let content = "10.0.0.1 80\n10.0.0.1 8080\n10.0.0.1 80\n";
        let tasks = parse_targets(content, &opts(ProbeType::Http, false)).unwrap();
        assert_eq!(keys(&tasks), vec!["http://10.0.0.1:80", "http://10.0.0.1:8080"]);
    }

    #[test]
    fn loose_domain_records_skip_non_domain_lines() {
        let mut options = opts(ProbeType::Icmp, true);
        options.expand.domain_a = true;
        let tasks = parse_targets("10.0.0.1\n10.0.0.0/30\n", &options).unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn strict_domain_records_reject_ip_lines() {
        let mut options = opts(ProbeType::Icmp, false);
        options.expand.domain_a = true;
        let err = parse_targets("10.0.0.1\n", &options).unwrap_err();
        assert!(matches!(err, ProbeError::FileFormat { line: 1 }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_target_file(Path::new("/nonexistent/reachprobe/targets"), &opts(ProbeType::Tcp, false))
            .unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }
}
