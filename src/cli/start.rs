use clap::Args;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use trawler_core::db::{CcPair, CcPairStatus, SearchSettings, SearchSettingsStatus};
use trawler_core::job::JobClient;
use trawler_core::kvs::Clock;
use trawler_core::queue::{
	CleanupCheckpointArgs, DocFetchingArgs, DocProcessingArgs, QueueName, TaskMessage, TaskName,
};
use trawler_core::{batch, db, kvs, pipeline, queue, rpc, EngineOptions, Orchestrator};

use super::{demo_sources, DEMO_CC_PAIR, DEMO_SEARCH_SETTINGS, TARGET};

#[derive(Args)]
pub struct StartArgs {
	/// The tenant this worker serves
	#[arg(long, default_value = "public")]
	tenant: String,
	/// The address the coordination endpoint binds to
	#[arg(long, default_value = "127.0.0.1:4580")]
	bind: String,
	/// Seconds between beat ticks
	#[arg(long, default_value_t = 15)]
	tick_interval: u64,
	/// Concurrent doc-processing consumers
	#[arg(long, default_value_t = 4)]
	processing_workers: usize,
	/// Seed a demo connector so a full pipeline run happens on startup
	#[arg(long)]
	demo: bool,
}

pub async fn run(args: StartArgs) -> ExitCode {
	info!(target: TARGET, tenant = %args.tenant, "Starting trawler worker");

	// single-node wiring: the worker owns the backing stores and serves
	// them to its spawned fetch processes over the coordination endpoint.
	// production deployments substitute shared networked stores here.
	let clock = Clock::default();
	let kv = Arc::new(kvs::mem::Datastore::new(clock.clone()));
	let db = Arc::new(db::mem::Datastore::new(clock.clone()));
	let task_queue = Arc::new(queue::mem::Datastore::new());
	let batches = Arc::new(batch::mem::Datastore::new());
	let sources = demo_sources();
	let pipelines = Arc::new(pipeline::stub::CountingPipelineFactory::new());

	let server =
		rpc::Server::new(kv.clone(), db.clone(), task_queue.clone(), batches.clone());
	let endpoint = match server.serve(&args.bind).await {
		Ok(endpoint) => endpoint,
		Err(error) => {
			error!(target: TARGET, %error, bind = %args.bind, "Could not bind the coordination endpoint");
			return ExitCode::FAILURE;
		}
	};

	// spawned children re-join the worker through the endpoint
	let jobs = match JobClient::current_exe() {
		Ok(client) => client.with_args(vec![
			"fetch".to_string(),
			"--endpoint".to_string(),
			endpoint.to_string(),
		]),
		Err(error) => {
			error!(target: TARGET, %error, "Could not resolve the worker executable");
			return ExitCode::FAILURE;
		}
	};

	if args.demo {
		db.insert_cc_pair(CcPair {
			id: DEMO_CC_PAIR,
			name: "demo".to_string(),
			source: "demo".to_string(),
			connector_id: Some(1),
			credential_id: Some(1),
			status: CcPairStatus::Scheduled,
			indexing_trigger: None,
			in_repeated_error_state: false,
			refresh_freq: Some(Duration::from_secs(3600)),
		})
		.await;
		db.insert_search_settings(SearchSettings {
			id: DEMO_SEARCH_SETTINGS,
			status: SearchSettingsStatus::Present,
			model_name: "embedder-small".to_string(),
			provider_type: None,
			background_reindex_enabled: false,
		})
		.await;
		info!(target: TARGET, cc_pair = DEMO_CC_PAIR, "Seeded the demo connector");
	}

	let orchestrator = Orchestrator::new(
		&args.tenant,
		clock,
		kv,
		db,
		task_queue.clone(),
		batches,
		sources,
		pipelines,
		jobs,
	)
	.with_options(
		EngineOptions::default().with_tick_interval(Duration::from_secs(args.tick_interval)),
	);

	// the beat scheduler
	{
		let orchestrator = orchestrator.clone();
		let interval = Duration::from_secs(args.tick_interval);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			loop {
				ticker.tick().await;
				if let Err(error) = orchestrator.check_for_indexing().await {
					warn!(target: TARGET, %error, "Beat tick failed");
				}
				if let Err(error) = orchestrator.check_for_checkpoint_cleanup().await {
					warn!(target: TARGET, %error, "Checkpoint sweep failed");
				}
			}
		});
	}

	// one consumer supervises one fetch child at a time
	spawn_fetch_worker(orchestrator.clone(), task_queue.clone());
	// batch processing fans out across the pool
	for _ in 0..args.processing_workers {
		spawn_processing_worker(orchestrator.clone(), task_queue.clone());
	}
	spawn_light_worker(orchestrator.clone(), task_queue.clone());

	match tokio::signal::ctrl_c().await {
		Ok(()) => info!(target: TARGET, "Shutdown signal received, exiting"),
		Err(error) => error!(target: TARGET, %error, "Could not listen for the shutdown signal"),
	}
	ExitCode::SUCCESS
}

fn spawn_fetch_worker(orchestrator: Orchestrator, queue: Arc<queue::mem::Datastore>) {
	tokio::spawn(async move {
		loop {
			let task = match queue.recv(QueueName::DocFetching).await {
				Ok(task) => task,
				Err(_) => return,
			};
			queue.mark_started(&task.id);
			let outcome = run_fetch_task(&orchestrator, &task).await;
			record_outcome(&queue, &task, outcome);
		}
	});
}

fn spawn_processing_worker(orchestrator: Orchestrator, queue: Arc<queue::mem::Datastore>) {
	tokio::spawn(async move {
		loop {
			let task = match queue.recv(QueueName::DocProcessing).await {
				Ok(task) => task,
				Err(_) => return,
			};
			queue.mark_started(&task.id);
			let outcome = run_processing_task(&orchestrator, &task).await;
			record_outcome(&queue, &task, outcome);
		}
	});
}

fn spawn_light_worker(orchestrator: Orchestrator, queue: Arc<queue::mem::Datastore>) {
	tokio::spawn(async move {
		loop {
			let task = match queue.recv(QueueName::Light).await {
				Ok(task) => task,
				Err(_) => return,
			};
			queue.mark_started(&task.id);
			let outcome = run_light_task(&orchestrator, &task).await;
			record_outcome(&queue, &task, outcome);
		}
	});
}

async fn run_fetch_task(orchestrator: &Orchestrator, task: &TaskMessage) -> Result<(), String> {
	let args: DocFetchingArgs =
		serde_json::from_value(task.args.clone()).map_err(|e| e.to_string())?;
	let orchestrator = orchestrator.for_tenant(&args.tenant_id);
	orchestrator.docfetching_watchdog(&args, &task.id).await.map_err(|e| e.to_string())
}

async fn run_processing_task(orchestrator: &Orchestrator, task: &TaskMessage) -> Result<(), String> {
	let args: DocProcessingArgs =
		serde_json::from_value(task.args.clone()).map_err(|e| e.to_string())?;
	let orchestrator = orchestrator.for_tenant(&args.tenant_id);
	orchestrator.docprocessing(&args).await.map_err(|e| e.to_string())
}

async fn run_light_task(orchestrator: &Orchestrator, task: &TaskMessage) -> Result<(), String> {
	match task.name {
		TaskName::CleanupCheckpoint => {
			let args: CleanupCheckpointArgs =
				serde_json::from_value(task.args.clone()).map_err(|e| e.to_string())?;
			let orchestrator = orchestrator.for_tenant(&args.tenant_id);
			orchestrator.cleanup_checkpoint(args.attempt_id).await.map_err(|e| e.to_string())
		}
		_ => Err(format!("unexpected task on the light queue: {}", task.name.as_str())),
	}
}

fn record_outcome(queue: &queue::mem::Datastore, task: &TaskMessage, outcome: Result<(), String>) {
	match outcome {
		Ok(()) => queue.mark_ready(&task.id, true, None, None),
		Err(trace) => {
			warn!(
				target: TARGET,
				task = task.name.as_str(),
				id = %task.id,
				"Task failed: {trace}",
			);
			queue.mark_ready(&task.id, false, Some(trace.clone()), Some(trace));
		}
	}
}
