use std::env;

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::fmt;

const DEBUG_ENV: &str = "RUNJ_DEBUG";

/// Initializes the global tracing subscriber.
///
/// With `RUNJ_DEBUG` set to a non-empty value, everything down to DEBUG goes
/// to stdout alongside the report. Otherwise only errors are emitted, on
/// stderr, so stdout stays reserved for the report line.
pub fn init() -> Result<()> {
    let debug = env::var(DEBUG_ENV).map(|value| !value.is_empty()).unwrap_or(false);

    let builder = fmt()
        .with_target(false)
        .without_time();

    if debug {
        builder
            .with_max_level(Level::DEBUG)
            .with_writer(std::io::stdout)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init logger: {err}"))?;
    } else {
        builder
            .with_max_level(Level::ERROR)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init logger: {err}"))?;
    }

    Ok(())
}
