//! Lane execution for connect-style probes (TCP, HTTP).
//!
//! One thread per lane walks its tasks in order, one attempt per task,
//! stopping early when the run is cancelled.

use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::ProbeType;
use crate::display::RoundHistory;
use crate::probe::Prober;
use crate::stats::{FailRateTracker, StatsSnapshot};
use crate::task::{TaskSet, WorkerLane};

/// Receives live results for display.
pub trait Reporter: Send + Sync {
    /// `totals` are the global `(success, fail)` counts right after this
    /// outcome was recorded.
    fn outcome(&self, label: &str, success: bool, totals: (u64, u64));

    /// Periodic refresh during a finite run.
    fn progress(&self, _snapshot: &StatsSnapshot, _planned: usize) {}

    /// Called once per continuous round after change detection.
    fn round(&self, _history: &RoundHistory) {}
}

/// Shared state every worker of a pass sees.
pub struct RunContext<'a> {
    pub tracker: &'a FailRateTracker,
    pub cancel: &'a CancelToken,
    pub timeout: Duration,
    pub reporter: &'a dyn Reporter,
}

/// Executes every lane of a task set and returns once all have finished.
pub trait PassRunner: Sync {
    fn run_pass(&self, task_set: &mut TaskSet, ctx: &RunContext<'_>);
}

pub struct ConnectRunner<'a> {
    prober: &'a dyn Prober,
}

impl<'a> ConnectRunner<'a> {
    pub fn new(prober: &'a dyn Prober) -> Self {
        Self { prober }
    }

    fn run_lane(&self, lane: &mut WorkerLane, ctx: &RunContext<'_>) {
        let lane_no = lane.lane;
        for task in lane.tasks.iter_mut() {
            if ctx.cancel.is_cancelled() {
                debug!(lane = lane_no, "lane stopped by cancellation");
                return;
            }

            let (success, label) = match task.probe_type {
                ProbeType::Tcp => (
                    self.prober.tcp(&task.target, task.port, task.timeout, task.src_ip),
                    format!("lane {:02}-batch {:06}\t{}\t{}", lane_no, task.batch, task.target, task.port),
                ),
                ProbeType::Http => (
                    self.prober.http(&task.target, task.timeout, task.src_ip),
                    format!("lane {:02}-batch {:06}\t{}", lane_no, task.batch, task.target),
                ),
                ProbeType::Icmp => continue,
            };
            task.completed = true;

            let totals = ctx.tracker.increment(&task.key(), success);
            ctx.reporter.outcome(&label, success, totals);
        }
    }
}

impl PassRunner for ConnectRunner<'_> {
    fn run_pass(&self, task_set: &mut TaskSet, ctx: &RunContext<'_>) {
        thread::scope(|scope| {
            for lane in task_set.lanes.iter_mut() {
                scope.spawn(move || self.run_lane(lane, ctx));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ProbeTask, distribute};
    use parking_lot::Mutex;
    use std::net::IpAddr;

    struct NoReport;

    impl Reporter for NoReport {
        fn outcome(&self, _label: &str, _success: bool, _totals: (u64, u64)) {}
    }

    /// Succeeds for even last octets, records the call order per target.
    #[derive(Default)]
    struct ParityProber {
        calls: Mutex<Vec<String>>,
    }

    impl Prober for ParityProber {
        fn tcp(&self, host: &str, _port: u16, _timeout: Duration, _src: Option<IpAddr>) -> bool {
            self.calls.lock().push(host.to_string());
            host.rsplit('.').next().and_then(|octet| octet.parse::<u8>().ok()).is_some_and(|o| o % 2 == 0)
        }

        fn http(&self, url: &str, _timeout: Duration, _src: Option<IpAddr>) -> bool {
            self.calls.lock().push(url.to_string());
            url.ends_with(":80")
        }
    }

    fn tasks(probe_type: ProbeType, targets: &[&str]) -> Vec<ProbeTask> {
        targets
            .iter()
            .map(|t| ProbeTask::new(*t, 80, probe_type, None, Duration::from_secs(1)))
            .collect()
    }

    #[test]
    fn every_task_is_probed_once_and_counted() {
        let prober = ParityProber::default();
        let runner = ConnectRunner::new(&prober);
        let tracker = FailRateTracker::new();
        let cancel = CancelToken::new();
        let ctx = RunContext {
            tracker: &tracker,
            cancel: &cancel,
            timeout: Duration::from_secs(1),
            reporter: &NoReport,
        };

        let mut set = distribute(
            tasks(ProbeType::Tcp, &["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]),
            2,
        );
        runner.run_pass(&mut set, &ctx);

        assert_eq!(tracker.totals(), (2, 3));
        assert_eq!(prober.calls.lock().len(), 5);
        assert_eq!(set.completed_count(), 5);
        let counts = tracker.key_counts("10.0.0.2|80").unwrap();
        assert_eq!((counts.success, counts.fail), (1, 0));
    }

    #[test]
    fn http_results_are_keyed_by_url() {
        let prober = ParityProber::default();
        let runner = ConnectRunner::new(&prober);
        let tracker = FailRateTracker::new();
        let cancel = CancelToken::new();
        let ctx = RunContext {
            tracker: &tracker,
            cancel: &cancel,
            timeout: Duration::from_secs(1),
            reporter: &NoReport,
        };

        let mut set = distribute(tasks(ProbeType::Http, &["http://a:80", "http://b:8080"]), 4);
        runner.run_pass(&mut set, &ctx);

        assert_eq!(tracker.key_counts("http://a:80").unwrap().success, 1);
        assert_eq!(tracker.key_counts("http://b:8080").unwrap().fail, 1);
    }

    #[test]
    fn cancelled_run_leaves_tasks_incomplete() {
        let prober = ParityProber::default();
        let runner = ConnectRunner::new(&prober);
        let tracker = FailRateTracker::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let ctx = RunContext {
            tracker: &tracker,
            cancel: &cancel,
            timeout: Duration::from_secs(1),
            reporter: &NoReport,
        };

        let mut set = distribute(tasks(ProbeType::Tcp, &["10.0.0.1", "10.0.0.2"]), 2);
        runner.run_pass(&mut set, &ctx);

        assert_eq!(tracker.totals(), (0, 0));
        assert_eq!(set.completed_count(), 0);
        assert!(prober.calls.lock().is_empty());
    }
}
