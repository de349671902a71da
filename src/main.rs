mod cli;

use std::process::ExitCode;

fn main() -> ExitCode {
	// the worker runtime is multi-threaded; the spawned fetch child builds
	// the same runtime fresh rather than inheriting anything
	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(runtime) => runtime,
		Err(error) => {
			eprintln!("failed to start the async runtime: {error}");
			return ExitCode::FAILURE;
		}
	};
	runtime.block_on(cli::init())
}
