mod acquisition;
mod config;
mod devices;

use acquisition::SonarLogger;
use clap::Parser;
use config::{Cli, DeviceConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up logging; the guard flushes the log file on exit
    let _guard = setup_logging();
    info!("Starting sonar logger");

    let cli = Cli::parse();
    let config = match cli.into_settings().and_then(DeviceConfig::new) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            eprintln!("Invalid configuration: {}", e);
            return Err(Box::new(e));
        }
    };
    info!("Using configuration: {:?}", config);

    let device = match acquisition::connect(&config) {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to connect to {}: {}", config.address, e);
            eprintln!("Failed to connect to {}: {}", config.address, e);
            return Err(Box::new(e));
        }
    };

    let mut logger = match SonarLogger::new(device, config) {
        Ok(logger) => logger,
        Err(e) => {
            error!("Device setup failed: {}", e);
            eprintln!("Device setup failed: {}", e);
            return Err(Box::new(e));
        }
    };

    // Only returns if writing the CSV fails
    if let Err(e) = logger.run() {
        error!("Acquisition stopped after {} rows: {}", logger.rows_written(), e);
        eprintln!("Acquisition stopped: {}", e);
        return Err(Box::new(e));
    }

    info!("Sonar logger shutting down");
    Ok(())
}

fn setup_logging() -> WorkerGuard {
    // File-based logging with daily rotation
    let file_appender = rolling::daily("logs", "sonar.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    fmt()
        .with_writer(non_blocking)
        .with_ansi(false) // Disable ANSI colors in log files
        .with_level(true)
        .init();

    guard
}
