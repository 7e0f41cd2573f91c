//! lineserve: a line-oriented TCP service.
//!
//! Demonstration binary around the `lineserve` library. Each inbound line
//! is answered with the same line in uppercase. Empty lines are rejected
//! as protocol violations, which closes the offending connection.

mod cli;

use cli::Config;
use lineserve::{Error, Service};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut service = Service::serve(config.service, uppercase)?;
    service.set_fatal_observer(|err| error!(error = %err, "Service stopped"));

    let settings = service.config();
    info!(
        addr = %service.local_addr(),
        poll_timeout_ms = settings.poll_timeout_ms,
        max_line_length = settings.max_line_length,
        "Serving lineserve"
    );

    service.join()?;
    Ok(())
}

fn uppercase(line: &str) -> Result<String, Error> {
    if line.trim().is_empty() {
        return Err(Error::protocol_violation("empty line"));
    }
    Ok(line.to_uppercase())
}
