use std::time::Duration;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use watchthreads::{Config, Controller};

/// Park two threads in read-watchpoint traps while the tracer that set them is stopped.
///
/// Must be started by its tracer (e.g. a debugger), unless `--standalone`.
#[derive(StructOpt, Debug)]
struct Opt {
    /// Run without a tracer: skip tracer validation, suspension and state polling.
    #[structopt(short, long)]
    standalone: bool,

    /// Seconds the main thread waits on any gate or state change.
    #[structopt(long, default_value = "10")]
    controller_timeout: u64,

    /// Seconds a worker thread waits on any gate.
    #[structopt(long, default_value = "15")]
    worker_timeout: u64,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::default()
        .standalone(opt.standalone)
        .controller_timeout(Duration::from_secs(opt.controller_timeout))
        .worker_timeout(Duration::from_secs(opt.worker_timeout));

    let rendezvous = Controller::system(config)
        .run()
        .context("rendezvous failed")?;

    debug!(?rendezvous, "rendezvous complete");

    Ok(())
}
