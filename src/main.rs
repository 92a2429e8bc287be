use std::time::Duration;

use airvisual::AirVisualClient;
use anyhow::Context;
use clap::Parser;
use config::Config;
use iot_hub::DeviceOptions;
use log::LevelFilter;
use relay::{IotHubSink, TelemetryRelayJob};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::time::{Instant, MissedTickBehavior};

mod airvisual;
mod config;
mod iot_hub;
mod relay;
mod telemetry;

const LOG_LEVEL_VAR: &str = "RELAY_LOG_LEVEL";

/// Relays IQAir nearest-city readings to Azure IoT Hub.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Run a single relay and exit instead of running on a schedule
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let level = std::env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|v| v.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    TermLogger::init(
        level,
        ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_time_offset_to_local()
            .map_err(|_| anyhow::anyhow!("Failed to set time offset to local"))?
            .build(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context("Failed to initialize logger")?;

    let config = Config::from_env().context("Failed to load configuration")?;
    log::debug!("{config:?}");

    let upstream = AirVisualClient::new(config.api_base_url.clone(), config.api_key.clone())?;
    let sink = IotHubSink::new(config.connection_string.clone(), DeviceOptions::default());
    let job = TelemetryRelayJob::new(upstream, sink);

    if cli.once {
        job.run().await;
        return Ok(());
    }

    run(job, config.interval).await
}

async fn run(job: TelemetryRelayJob<IotHubSink>, period: Duration) -> Result<(), anyhow::Error> {
    log::info!("Relaying telemetry every {:?}", period);

    let scheduler = tokio::spawn(schedule(job, period));

    tokio::select! {
        result = scheduler => {
            result.context("Relay scheduler panicked")??;
            Err(anyhow::anyhow!("Relay scheduler stopped"))
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to wait for Ctrl+C signal")?;
            Ok(())
        }
    }
}

async fn schedule(job: TelemetryRelayJob<IotHubSink>, period: Duration) -> Result<(), anyhow::Error> {
    let start = Instant::now()
        .checked_add(period)
        .with_context(|| format!("Relay interval {period:?} is out of range"))?;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let scheduled = ticker.tick().await;
        if scheduled.elapsed() >= period {
            log::info!("The timer is past due!");
        }

        job.run().await;
    }
}
