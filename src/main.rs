use std::process::ExitCode;
use std::time::Duration;

use combine_mcp::config::Settings;
use combine_mcp::isolation::StdoutGuard;

fn main() -> ExitCode {
    // Isolate stdout FIRST, before anything can write to it.
    let stdout_guard = match StdoutGuard::engage() {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: could not isolate stdout during startup: {e}");
            StdoutGuard::disengaged()
        }
    };

    let settings = Settings::from_env();
    if let Err(e) = combine_mcp::init_tracing(&settings) {
        eprintln!("Error initializing logger: {e:#}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(combine_mcp::run(settings, stdout_guard));
    // The blocking stdin reader may still be parked; don't wait for it.
    runtime.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "combine-mcp exiting");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
