mod fetch;
mod start;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use trawler_core::pipeline::stub::StaticSourceFactory;
use trawler_core::pipeline::Document;

pub(crate) const TARGET: &str = "trawler::cli";

/// The cc-pair the demo wiring seeds and serves documents for
pub(crate) const DEMO_CC_PAIR: i64 = 1;
pub(crate) const DEMO_SEARCH_SETTINGS: i64 = 1;

#[derive(Parser)]
#[command(name = "trawler", about = "A distributed indexing pipeline orchestrator")]
struct Cli {
	/// Log filter directives
	#[arg(long, env = "TRAWLER_LOG", default_value = "info", global = true)]
	log: String,
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Starts the worker: beat scheduler, coordination endpoint, consumers
	Start(start::StartArgs),
	/// Runs one spawned document fetch (internal; invoked by the watchdog)
	#[command(hide = true)]
	Fetch(fetch::FetchArgs),
}

pub async fn init() -> ExitCode {
	let cli = Cli::parse();
	// logs go to stderr so the watchdog can retain a diagnostic tail from
	// spawned children
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::new(&cli.log))
		.with_writer(std::io::stderr)
		.init();
	match cli.command {
		Commands::Start(args) => start::run(args).await,
		Commands::Fetch(args) => fetch::run(args).await,
	}
}

/// The built-in demo document source.
///
/// Both the worker and its spawned fetch processes construct this locally;
/// only coordination state travels over the shared endpoint, exactly as a
/// real connector would read its source directly.
pub(crate) fn demo_sources() -> Arc<StaticSourceFactory> {
	let sources = StaticSourceFactory::new();
	let batches = (0..3)
		.map(|batch| {
			(0..8)
				.map(|n| Document {
					id: format!("demo-{batch}-{n}"),
					content: format!("demo document {n} of batch {batch}"),
				})
				.collect()
		})
		.collect();
	sources.seed(DEMO_CC_PAIR, batches);
	Arc::new(sources)
}
