//! Run orchestration.
//!
//! A finite run replicates the targets `repeat` times and executes one
//! pass while the summary table refreshes every second. A continuous run
//! (`repeat == 0`) executes one pass per round, at most one round per
//! second, and reports which targets flipped since the previous round.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::{ProbeConfig, ProbeType, TargetSource};
use crate::display::RoundHistory;
use crate::error::{ProbeError, Result};
use crate::executor::{PassRunner, Reporter, RunContext};
use crate::ingest::{self, IngestOptions};
use crate::stats::FailRateTracker;
use crate::target::{self, ExpandOptions};
use crate::task::{ProbeTask, distribute, replicate};

pub const MIN_ROUND_DURATION: Duration = Duration::from_secs(1);
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Expands the configured target or target file into the deduplicated
/// base task list.
pub fn build_tasks(config: &ProbeConfig) -> Result<Vec<ProbeTask>> {
    let expand = ExpandOptions {
        probe_type: config.probe_type,
        src_ip: config.src_ip,
        timeout: config.timeout,
        domain_a: config.domain_a,
    };

    let tasks = match &config.source {
        TargetSource::Single(destination) => {
            let mut tasks = target::expand(destination, config.port, &expand)?;
            if config.probe_type == ProbeType::Http {
                target::render_http(&mut tasks);
            }
            tasks
        }
        TargetSource::File { path, loose } => ingest::load_target_file(
            path,
            &IngestOptions {
                expand,
                default_port: config.port,
                loose: *loose,
            },
        )?,
    };

    if tasks.is_empty() {
        return Err(ProbeError::NoTasks);
    }
    Ok(tasks)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Tasks per pass after replication.
    pub planned: usize,
    /// Completed rounds; always 1 for a finite run that was not cancelled.
    pub rounds: u64,
    pub success: u64,
    pub fail: u64,
    pub elapsed: Duration,
}

pub struct Scheduler<'a> {
    config: &'a ProbeConfig,
    runner: &'a dyn PassRunner,
    tracker: &'a FailRateTracker,
    cancel: &'a CancelToken,
    reporter: &'a dyn Reporter,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        config: &'a ProbeConfig,
        runner: &'a dyn PassRunner,
        tracker: &'a FailRateTracker,
        cancel: &'a CancelToken,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            config,
            runner,
            tracker,
            cancel,
            reporter,
        }
    }

    pub fn run(&self, tasks: &[ProbeTask]) -> Result<RunSummary> {
        let replicated = replicate(tasks, self.config.repeat);
        if replicated.is_empty() {
            return Err(ProbeError::NoTasks);
        }
        info!(
            targets = tasks.len(),
            planned = replicated.len(),
            concurrency = self.config.concurrency,
            probe_type = %self.config.probe_type,
            continuous = self.config.is_continuous(),
            "starting run"
        );

        let started = Instant::now();
        let mut summary = if self.config.is_continuous() {
            self.run_rounds(replicated)
        } else {
            self.run_once(replicated)
        };
        summary.elapsed = started.elapsed();
        info!(
            rounds = summary.rounds,
            success = summary.success,
            fail = summary.fail,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run finished"
        );
        Ok(summary)
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            tracker: self.tracker,
            cancel: self.cancel,
            timeout: self.config.timeout,
            reporter: self.reporter,
        }
    }

    fn run_once(&self, replicated: Vec<ProbeTask>) -> RunSummary {
        let planned = replicated.len();
        let mut task_set = distribute(replicated, self.config.concurrency);
        debug!(task_set = %task_set.id, lanes = task_set.lanes.len(), "task set distributed");

        let ctx = self.context();
        let refresh_stop = CancelToken::new();
        thread::scope(|scope| {
            scope.spawn(|| self.refresh_loop(&refresh_stop, planned));
            self.runner.run_pass(&mut task_set, &ctx);
            refresh_stop.cancel();
        });

        let (success, fail) = self.tracker.totals();
        RunSummary {
            planned,
            rounds: if self.cancel.is_cancelled() { 0 } else { 1 },
            success,
            fail,
            elapsed: Duration::ZERO,
        }
    }

    fn refresh_loop(&self, stop: &CancelToken, planned: usize) {
        loop {
            self.reporter.progress(&self.tracker.snapshot(), planned);
            if !stop.sleep(REFRESH_INTERVAL) {
                break;
            }
        }
        self.reporter.progress(&self.tracker.snapshot(), planned);
    }

    fn run_rounds(&self, replicated: Vec<ProbeTask>) -> RunSummary {
        let planned = replicated.len();
        let ctx = self.context();
        let mut history = RoundHistory::new();
        let mut summary = RunSummary {
            planned,
            rounds: 0,
            success: 0,
            fail: 0,
            elapsed: Duration::ZERO,
        };

        while !self.cancel.is_cancelled() {
            let round_started = Instant::now();
            let mut task_set = distribute(replicated.clone(), self.config.concurrency);
            self.runner.run_pass(&mut task_set, &ctx);
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(rest) = MIN_ROUND_DURATION.checked_sub(round_started.elapsed()) {
                self.cancel.sleep(rest);
            }

            self.tracker.statistic();
            let snapshot = self.tracker.snapshot();
            summary.success += snapshot.success;
            summary.fail += snapshot.fail;
            summary.rounds += 1;
            history.append(&snapshot);
            self.reporter.round(&history);
            self.tracker.clean();
        }
        summary
    }
}
