//! Probe tasks and their distribution over worker lanes.
//!
//! A flat target list is replicated once per requested pass and then dealt
//! into lanes column by column, alternating direction on every column
//! (boustrophedon). One column across all lanes is a batch.

use std::net::IpAddr;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{MAX_ICMP_IDENTIFIER, ProbeType, icmp_send_interval};

/// Correlation data carried by ICMP tasks only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpTag {
    pub id: u16,
    pub seq: u16,
    pub send_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTask {
    /// Column of the snake distribution, 1-based. 0 until distributed.
    pub batch: usize,
    /// Host, IP literal or rendered `http://host:port` URL.
    pub target: String,
    /// Ignored for ICMP.
    pub port: u16,
    pub src_ip: Option<IpAddr>,
    pub timeout: Duration,
    pub probe_type: ProbeType,
    pub icmp: Option<IcmpTag>,
    pub completed: bool,
}

impl ProbeTask {
    pub fn new(
        target: impl Into<String>,
        port: u16,
        probe_type: ProbeType,
        src_ip: Option<IpAddr>,
        timeout: Duration,
    ) -> Self {
        Self {
            batch: 0,
            target: target.into(),
            port,
            src_ip,
            timeout,
            probe_type,
            icmp: None,
            completed: false,
        }
    }

    /// Statistics and de-duplication key: `host|port` for TCP, the target
    /// string otherwise.
    pub fn key(&self) -> String {
        match self.probe_type {
            ProbeType::Tcp => format!("{}|{}", self.target, self.port),
            ProbeType::Icmp | ProbeType::Http => self.target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLane {
    /// 1-based lane number.
    pub lane: usize,
    pub tasks: Vec<ProbeTask>,
}

impl WorkerLane {
    fn new(lane: usize) -> Self {
        Self {
            lane,
            tasks: Vec::new(),
        }
    }
}

/// All lanes produced by one distribution call.
#[derive(Debug, Clone)]
pub struct TaskSet {
    /// Time-ordered (UUIDv7), so later task sets sort after earlier ones.
    pub id: Uuid,
    pub lanes: Vec<WorkerLane>,
}

impl TaskSet {
    pub fn task_count(&self) -> usize {
        self.lanes.iter().map(|lane| lane.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &ProbeTask> {
        self.lanes.iter().flat_map(|lane| lane.tasks.iter())
    }

    pub fn completed_count(&self) -> usize {
        self.tasks().filter(|task| task.completed).count()
    }
}

/// Maps the i-th ICMP send of a pass to its `(identifier, sequence)` pair.
///
/// Distinct for every index below `65535 * 65535`; beyond that pairs repeat.
pub fn icmp_id_seq(index: u64) -> (u16, u16) {
    let id = MAX_ICMP_IDENTIFIER.wrapping_sub(index / MAX_ICMP_IDENTIFIER);
    let seq = index % MAX_ICMP_IDENTIFIER;
    (id as u16, seq as u16)
}

/// Copies `tasks` once per pass (`repeat`, or once when 0 for continuous
/// mode) in pass-major order and tags every ICMP copy with its own
/// correlation pair.
pub fn replicate(tasks: &[ProbeTask], repeat: u32) -> Vec<ProbeTask> {
    let passes = repeat.max(1) as usize;
    let send_interval = icmp_send_interval();
    let mut replicated = Vec::with_capacity(tasks.len() * passes);
    let mut send_index = 0u64;

    for _ in 0..passes {
        for task in tasks {
            let mut copy = ProbeTask {
                batch: 0,
                icmp: None,
                completed: false,
                ..task.clone()
            };
            if copy.probe_type == ProbeType::Icmp {
                let (id, seq) = icmp_id_seq(send_index);
                copy.icmp = Some(IcmpTag {
                    id,
                    seq,
                    send_interval,
                });
                send_index += 1;
            }
            replicated.push(copy);
        }
    }
    replicated
}

/// Deals `tasks` into `min(concurrency, tasks.len())` lanes in snake order.
pub fn distribute(tasks: Vec<ProbeTask>, concurrency: usize) -> TaskSet {
    let total = tasks.len();
    let lane_count = concurrency.max(1).min(total);
    let mut lanes: Vec<WorkerLane> = (1..=lane_count).map(WorkerLane::new).collect();

    if lane_count > 0 {
        let columns = total.div_ceil(lane_count);
        let mut remaining = tasks.into_iter();
        'columns: for column in 0..columns {
            for slot in 0..lane_count {
                let lane = if column % 2 == 0 {
                    slot
                } else {
                    lane_count - 1 - slot
                };
                let Some(mut task) = remaining.next() else {
                    break 'columns;
                };
                task.batch = column + 1;
                lanes[lane].tasks.push(task);
            }
        }
    }

    TaskSet {
        id: Uuid::now_v7(),
        lanes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tcp_tasks(count: usize) -> Vec<ProbeTask> {
        (0..count)
            .map(|i| {
                ProbeTask::new(
                    format!("10.0.0.{i}"),
                    80,
                    ProbeType::Tcp,
                    None,
                    Duration::from_secs(1),
                )
            })
            .collect()
    }

    #[test]
    fn icmp_pairs_at_known_indices() {
        assert_eq!(icmp_id_seq(0), (65535, 0));
        assert_eq!(icmp_id_seq(1), (65535, 1));
        assert_eq!(icmp_id_seq(65534), (65535, 65534));
        assert_eq!(icmp_id_seq(65535), (65534, 0));
        assert_eq!(icmp_id_seq(65535 * 65535 - 1), (1, 65534));
    }

    #[test]
    fn icmp_pairs_do_not_collide_across_identifier_boundaries() {
        let mut seen = HashSet::new();
        for base in [0u64, 65535 * 10, 65535 * 65534] {
            for index in base.saturating_sub(300)..base + 65535 + 300 {
                if index >= 65535 * 65535 {
                    break;
                }
                let (id, seq) = icmp_id_seq(index);
                let decoded = (65535 - id as u64) * 65535 + seq as u64;
                assert_eq!(decoded, index);
                assert!(seen.insert((id, seq)), "duplicate pair for {index}");
            }
        }
    }

    #[test]
    fn replicate_is_pass_major_and_tags_icmp() {
        let base = vec![
            ProbeTask::new("a", 0, ProbeType::Icmp, None, Duration::from_secs(1)),
            ProbeTask::new("b", 0, ProbeType::Icmp, None, Duration::from_secs(1)),
        ];
        let copies = replicate(&base, 3);
        let targets: Vec<&str> = copies.iter().map(|t| t.target.as_str()).collect();
        assert_eq!(targets, vec!["a", "b", "a", "b", "a", "b"]);

        let pairs: Vec<(u16, u16)> = copies
            .iter()
            .map(|t| {
                let tag = t.icmp.expect("icmp tag");
                (tag.id, tag.seq)
            })
            .collect();
        assert_eq!(pairs, (0..6).map(icmp_id_seq).collect::<Vec<_>>());
        assert!(copies.iter().all(|t| t.icmp.unwrap().send_interval == icmp_send_interval()));
    }

    #[test]
    fn replicate_zero_means_single_pass() {
        let copies = replicate(&tcp_tasks(3), 0);
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|t| t.icmp.is_none()));
    }

    #[test]
    fn distribute_keeps_every_task_exactly_once() {
        for (count, concurrency) in [(1, 1), (7, 3), (10, 4), (3, 11), (100, 11), (12, 12)] {
            let set = distribute(tcp_tasks(count), concurrency);
            assert_eq!(set.task_count(), count);
            assert_eq!(set.lanes.len(), concurrency.min(count));
            assert!(set.lanes.iter().all(|lane| !lane.tasks.is_empty()));

            let unique: HashSet<&str> = set.tasks().map(|t| t.target.as_str()).collect();
            assert_eq!(unique.len(), count);
        }
    }

    #[test]
    fn distribute_snakes_across_lanes() {
        let set = distribute(tcp_tasks(7), 3);
        let lanes: Vec<Vec<(&str, usize)>> = set
            .lanes
            .iter()
            .map(|lane| {
                lane.tasks
                    .iter()
                    .map(|t| (t.target.as_str(), t.batch))
                    .collect()
            })
            .collect();
        assert_eq!(
            lanes,
            vec![
                vec![("10.0.0.0", 1), ("10.0.0.5", 2), ("10.0.0.6", 3)],
                vec![("10.0.0.1", 1), ("10.0.0.4", 2)],
                vec![("10.0.0.2", 1), ("10.0.0.3", 2)],
            ]
        );
    }

    #[test]
    fn distribute_empty_list_yields_no_lanes() {
        let set = distribute(Vec::new(), 8);
        assert!(set.lanes.is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn task_set_ids_are_time_ordered() {
        let ids: Vec<Uuid> = (0..64).map(|_| distribute(tcp_tasks(1), 1).id).collect();
        assert!(ids.iter().all(|id| id.get_version() == Some(uuid::Version::SortRand)));
        assert!(ids.windows(2).all(|pair| pair[1] > pair[0]));
    }
}
