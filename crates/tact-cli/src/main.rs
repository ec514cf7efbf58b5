use clap::Parser;
use miette::Result;
use std::path::PathBuf;
use std::sync::Mutex;
use tact::reporter::{ListReporter, Reporter};
use tact::runner::ExecutionOptions;

#[derive(Debug, Parser)]
#[command(
    name = "tact",
    version,
    about = "Terminal-application test runner: drives real shells in PTYs"
)]
struct Cli {
    /// Regenerate snapshots instead of comparing against them.
    #[arg(long)]
    update_snapshot: bool,

    /// Explicit config file (default: tact.config.json|yaml in the cwd).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Regexes over test file paths; tests in matching files run.
    filters: Vec<String>,
}

fn main() -> Result<()> {
    // Re-executions of this binary serve as pool workers.
    tact::bootstrap_worker();

    let cli = Cli::parse();
    let cwd = std::env::current_dir()
        .map_err(|err| miette::miette!("failed to determine working directory: {err}"))?;
    let config = tact::config::load(&cwd, cli.config.as_deref())?;

    let options = ExecutionOptions {
        update_snapshots: cli.update_snapshot,
        test_filter: cli.filters,
    };
    let reporter = Mutex::new(ListReporter::new(config.fail_on_flaky));
    let reporter: &Mutex<dyn Reporter> = &reporter;

    let failures = tact::runner::run(&cwd, &config, &options, reporter)?;
    if failures > 0 {
        // Exit code caps at 255; 1 stays reserved-compatible since any
        // failure is non-zero.
        #[allow(clippy::cast_possible_truncation)]
        std::process::exit(failures.min(255) as i32);
    }
    Ok(())
}
