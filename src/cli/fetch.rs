use clap::Args;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use trawler_core::job::JobClient;
use trawler_core::kvs::Clock;
use trawler_core::pipeline::stub::CountingPipelineFactory;
use trawler_core::queue::DocFetchingArgs;
use trawler_core::{rpc, Orchestrator};

use super::{demo_sources, TARGET};

#[derive(Args)]
pub struct FetchArgs {
	/// The coordination endpoint published by the spawning worker
	#[arg(long, env = "TRAWLER_ENDPOINT")]
	endpoint: String,
	#[arg(long)]
	tenant: String,
	#[arg(long)]
	attempt_id: i64,
	#[arg(long)]
	cc_pair_id: i64,
	#[arg(long)]
	search_settings_id: i64,
}

/// The spawned fetch entrypoint.
///
/// Runs in a fresh process: the runtime, clock and telemetry are
/// re-initialized here rather than inherited from the worker, and all
/// coordination state is reached through the worker's endpoint so this
/// process observes the same fences, rows, queues and batches. The outcome
/// travels back to the watchdog purely as the process exit code.
pub async fn run(args: FetchArgs) -> ExitCode {
	info!(
		target: TARGET,
		tenant = %args.tenant,
		attempt = args.attempt_id,
		endpoint = %args.endpoint,
		"Fetch process starting",
	);

	let client = match rpc::Client::connect(&args.endpoint).await {
		Ok(client) => Arc::new(client),
		Err(error) => {
			error!(target: TARGET, %error, "Could not reach the coordination endpoint");
			return ExitCode::FAILURE;
		}
	};
	let jobs = match JobClient::current_exe() {
		Ok(client) => client.with_args(vec!["fetch".to_string()]),
		Err(error) => {
			error!(target: TARGET, %error, "Could not resolve the worker executable");
			return ExitCode::FAILURE;
		}
	};

	// one shared connection backs the store, catalog, queue and batches
	let orchestrator = Orchestrator::new(
		&args.tenant,
		Clock::default(),
		client.clone(),
		client.clone(),
		client.clone(),
		client.clone(),
		demo_sources(),
		Arc::new(CountingPipelineFactory::new()),
		jobs,
	);

	let fetch_args = DocFetchingArgs {
		attempt_id: args.attempt_id,
		cc_pair_id: args.cc_pair_id,
		search_settings_id: args.search_settings_id,
		tenant_id: args.tenant.clone(),
	};
	match orchestrator.run_docfetching(&fetch_args).await {
		Ok(total_docs) => {
			info!(target: TARGET, total_docs, "Fetch process finished");
			ExitCode::SUCCESS
		}
		Err(error) => {
			// the exit code is the whole child-to-parent protocol
			error!(target: TARGET, %error, "Fetch process failed");
			let code = error.exit_code().unwrap_or(255).clamp(0, 255) as u8;
			ExitCode::from(code)
		}
	}
}
