use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use reachprobe::cancel::CancelToken;
use reachprobe::cli::CliArgs;
use reachprobe::config::ProbeType;
use reachprobe::display::ConsoleReporter;
use reachprobe::executor::{ConnectRunner, PassRunner};
use reachprobe::icmp::{CorrelationTable, IcmpRunner, IcmpTransport};
use reachprobe::logging::init_logging;
use reachprobe::probe::NetProber;
use reachprobe::scheduler::{self, Scheduler};
use reachprobe::stats::FailRateTracker;
use reachprobe::{ProbeConfig, ProbeTask};

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = args.into_config()?;
    let log = init_logging(config.log_level)?;

    let started = Instant::now();
    info!(?config, "starting reachprobe");

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel()).context("Failed to install Ctrl-C handler")?;
    }

    let tasks = scheduler::build_tasks(&config).inspect_err(|err| error!(error = %err, "cannot build tasks"))?;
    let tracker = FailRateTracker::new();
    let reporter = ConsoleReporter::new(&config);

    let summary = match config.probe_type {
        ProbeType::Tcp | ProbeType::Http => {
            let prober = NetProber::new();
            let runner = ConnectRunner::new(&prober);
            run(&config, &tasks, &runner, &tracker, &cancel, &reporter)?
        }
        ProbeType::Icmp => {
            let transport = IcmpTransport::open(config.src_ip)
                .context("Failed to create raw ICMP socket. Check permissions (sudo/admin).")?;
            let table = CorrelationTable::new();
            let runner = IcmpRunner::new(&transport, &table);
            run(&config, &tasks, &runner, &tracker, &cancel, &reporter)?
        }
    };

    println!(
        "Finished {} round(s), {} succeeded, {} failed. Total time: {:.2?}",
        summary.rounds,
        summary.success,
        summary.fail,
        started.elapsed()
    );
    println!("Log written to {}", log.path.display());
    Ok(())
}

fn run(
    config: &ProbeConfig,
    tasks: &[ProbeTask],
    runner: &dyn PassRunner,
    tracker: &FailRateTracker,
    cancel: &CancelToken,
    reporter: &ConsoleReporter,
) -> Result<scheduler::RunSummary> {
    let summary = Scheduler::new(config, runner, tracker, cancel, reporter).run(tasks)?;
    Ok(summary)
}
