use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use pv_edge_coordinator::config::AppConfig;
use pv_edge_coordinator::coordinator::{BootError, MasterCoordinator};
use pv_edge_coordinator::forecast::{
    peak_hours::KompasClient, prices::PsePriceClient, pv::WeatherPvSource,
    weather::OpenMeteoClient, MarketPriceSource, PeakLabelSource, PvForecastSource, WeatherSource,
};
use pv_edge_coordinator::inverter::factory::build_inverter;
use pv_edge_coordinator::storage::build_storage;
use pv_edge_coordinator::telemetry::{init_tracing, shutdown_signal};

/// Edge coordinator for a residential PV + battery site.
#[derive(Debug, Parser)]
#[command(name = "pv-edge-coordinator", version, about)]
struct Cli {
    /// Directory with the layered YAML configuration
    /// (baseline.yaml / local.yaml / override.yaml).
    #[arg(long, default_value = "config")]
    config: PathBuf,

    /// Print the last persisted coordinator state as JSON and exit.
    #[arg(long)]
    status: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cfg = match AppConfig::load_layered(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{e:#}"), "configuration error");
            return ExitCode::from(1);
        }
    };

    let storage = match build_storage(&cfg.data_storage).await {
        Ok(storage) => storage,
        Err(e) => {
            error!(error = %format!("{e:#}"), "storage initialization failed");
            return ExitCode::from(1);
        }
    };

    if cli.status {
        return print_status(storage.as_ref()).await;
    }

    std::fs::create_dir_all(&cfg.web_server.log_directory).ok();

    let inverter = match build_inverter(&cfg.inverter) {
        Ok(inverter) => inverter,
        Err(e) => {
            error!(error = %e, "inverter configuration error");
            return ExitCode::from(1);
        }
    };

    let market_ttl = Duration::from_secs(15 * 60);
    let price_source: Option<Arc<dyn MarketPriceSource>> = match PsePriceClient::new(market_ttl) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "price client unavailable, continuing without");
            None
        }
    };
    let peak_source: Option<Arc<dyn PeakLabelSource>> = if cfg.pse_peak_hours.enabled {
        match KompasClient::new(Duration::from_secs(3600)) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "peak-hours client unavailable, continuing without");
                None
            }
        }
    } else {
        None
    };
    let weather_source: Option<Arc<dyn WeatherSource>> = if cfg.weather_integration.enabled {
        // Warsaw as the default site location; a dedicated section can
        // override this once per-site geodata is configured.
        match OpenMeteoClient::new(52.23, 21.01, Duration::from_secs(3600)) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "weather client unavailable, continuing without");
                None
            }
        }
    } else {
        None
    };

    // Without a dedicated PV forecast feed, derive one from the weather.
    let pv_source: Option<Arc<dyn PvForecastSource>> = weather_source.as_ref().map(|weather| {
        Arc::new(WeatherPvSource::new(
            Arc::clone(weather),
            cfg.pv_consumption_analysis.pv_capacity_kw,
        )) as Arc<dyn PvForecastSource>
    });

    let coordinator = Arc::new(MasterCoordinator::new(
        cfg,
        inverter,
        storage,
        price_source,
        peak_source,
        pv_source,
        weather_source,
    ));

    if let Err(e) = coordinator.initialize().await {
        error!(error = %e, "boot failed");
        return match e {
            BootError::Inverter(_) => ExitCode::from(3),
            BootError::UnsafeAtBoot(_) => ExitCode::from(2),
            BootError::Other(_) => ExitCode::from(1),
        };
    }

    let cancel = coordinator.cancel_token();
    let run_handle = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run().await })
    };
    info!("coordinator started");

    shutdown_signal().await;
    cancel.cancel();
    match run_handle.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "coordinator loop failed");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "coordinator task panicked");
            ExitCode::from(1)
        }
    }
}

/// One-shot synchronous facade over the persisted state.
async fn print_status(storage: &dyn pv_edge_coordinator::storage::Storage) -> ExitCode {
    let states = match storage.latest_states(1).await {
        Ok(states) => states,
        Err(e) => {
            error!(error = %e, "status query failed");
            return ExitCode::from(1);
        }
    };
    let now = chrono::Utc::now();
    let decisions = storage
        .decisions(now - chrono::Duration::hours(24), now)
        .await
        .unwrap_or_default();

    let payload = serde_json::json!({
        "state": states.last(),
        "decisions_last_24h": decisions.len(),
        "last_decision": decisions.last(),
        "storage_healthy": storage.health_check().await,
    });
    match serde_json::to_string_pretty(&payload) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "status serialization failed");
            ExitCode::from(1)
        }
    }
}
