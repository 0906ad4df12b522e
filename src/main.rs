use std::env;
use std::fs;
use std::io::Read;

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use runj::config::RunjConfig;
use runj::{container, execute, observability};

const INPUT_FILE_ENV: &str = "RUNJ_FILE";

fn main() {
    // The trampoline dispatch comes before everything else: the re-exec'd
    // init process carries the container's stdio on fds 0/1/2 and must not
    // write anywhere.
    if env::args().nth(1).as_deref() == Some(container::INIT_ARG) {
        container::init::run();
    }

    if let Err(err) = observability::init() {
        eprintln!("failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    if let Err(err) = try_main() {
        tracing::error!("{err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let input = read_input()?;

    let config: RunjConfig =
        serde_json::from_str(&input).context("Error unmarshalling the input")?;
    config.validate().context("Invalid config")?;

    // The shutdown signals are blocked before any thread exists so every
    // thread inherits the mask and the cancellation watcher can sigwait.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("Error blocking the shutdown signals")?;

    let report = execute::execute(&config).context("Error executing the container")?;

    let output = serde_json::to_string(&report).context("Error marshalling the report")?;
    println!("{output}");

    Ok(())
}

fn read_input() -> Result<String> {
    match env::var(INPUT_FILE_ENV) {
        Ok(path) if !path.is_empty() => fs::read_to_string(&path)
            .with_context(|| format!("Error reading the input file {path}")),
        _ => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("Error reading from stdin")?;
            Ok(input)
        }
    }
}
