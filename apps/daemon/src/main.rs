use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use fsn_watcher::{
	mounts::SystemMounts,
	protocol::{Report, Reporter},
	pump::NativePump,
	Service, ServiceConfig,
};
use tokio::io::BufReader;
use tracing::error;
use tracing_subscriber::EnvFilter;

// Setup-failure exit codes differ per platform; parents key off the GIVEUP
// report, not these.
#[cfg(target_os = "linux")]
const SETUP_FAILURE_EXIT: u8 = 3;
#[cfg(target_os = "macos")]
const SETUP_FAILURE_EXIT: u8 = 4;
#[cfg(windows)]
const SETUP_FAILURE_EXIT: u8 = 5;

const RUNTIME_FAILURE_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(
	name = "fsn-daemon",
	about = "File system change-notification helper, driven over stdin/stdout",
	version
)]
struct Args {
	/// Missing-root retry and housekeeping interval, in milliseconds
	#[arg(long, env = "FSN_POLL_INTERVAL_MS", default_value_t = 1000)]
	poll_interval_ms: u64,

	/// How long an overflowed subtree is held back before RECDIRTY, in
	/// milliseconds
	#[arg(long, env = "FSN_OVERFLOW_DEBOUNCE_MS", default_value_t = 500)]
	overflow_debounce_ms: u64,

	/// Log filter (tracing syntax); logs go to stderr, stdout carries the
	/// protocol
	#[arg(long, env = "FSN_LOG", default_value = "info")]
	log: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::new(&args.log))
		.with_writer(std::io::stderr)
		.init();

	let (events_tx, events_rx) = async_channel::unbounded();

	let pump = match NativePump::new(
		events_tx,
		Duration::from_millis(args.overflow_debounce_ms),
	) {
		Ok(pump) => pump,
		Err(e) => {
			error!(?e, "Unable to open the kernel notification facility;");
			Reporter::new(tokio::io::stdout())
				.send(&Report::GiveUp)
				.await
				.ok();
			return ExitCode::from(SETUP_FAILURE_EXIT);
		}
	};

	let service = Service::new(
		pump,
		Arc::new(SystemMounts),
		ServiceConfig {
			poll_interval: Duration::from_millis(args.poll_interval_ms),
		},
	);

	match service
		.run(
			events_rx,
			BufReader::new(tokio::io::stdin()),
			tokio::io::stdout(),
		)
		.await
	{
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!(?e, "Watcher service failed;");
			ExitCode::from(RUNTIME_FAILURE_EXIT)
		}
	}
}
