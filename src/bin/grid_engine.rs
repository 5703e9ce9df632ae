//! Grid Engine Binary
//!
//! Runs the configured grid strategies against the paper venue.
//!
//! ```bash
//! cargo run --bin grid_engine -- --config config.toml
//! ```
//!
//! Settings can be overridden from the environment (or a `.env` file), e.g.
//! `APP_LOG__LEVEL=debug`.

use std::collections::BTreeSet;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::interval;

use grid_engine::config::Settings;
use grid_engine::engine::{
    default_unexpected_cancel_handler, halt_strategy, launch_strategy, StrategyEngine,
};
use grid_engine::grid::{GridResult, GridStore, MemoryStore, StrategyStatus, VenueGateways};
use grid_engine::market::{oscillating_price, PaperVenue};
use grid_engine::strategy::{StrategyContext, StrategyRegistry};

const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();

    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        DEFAULT_CONFIG.to_string()
    };

    let settings = match Settings::new(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
            error!("Failed to load settings from {}: {}", config_path, e);
            return;
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str()))
        .init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    if let Err(e) = run(settings).await {
        error!("Grid engine failed: {}", e);
    }
}

async fn run(settings: Settings) -> GridResult<()> {
    let store: Arc<dyn GridStore> = match &settings.store.state_file {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => {
            warn!("No state file configured, strategy state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let engine = StrategyEngine::new(settings.engine.clone(), store.clone());
    engine.set_unexpected_cancel_handler(default_unexpected_cancel_handler());

    let venue = PaperVenue::new(&settings.paper.venue, settings.paper.starting_balance);
    let symbols: BTreeSet<String> = settings
        .strategies
        .iter()
        .map(|s| s.record.symbol.clone())
        .collect();
    for symbol in &symbols {
        venue.set_mark_price(symbol, settings.paper.initial_price).await;
    }

    let mut gateways = VenueGateways::new();
    gateways.register(venue.name(), Arc::new(venue.clone()));
    let registry = StrategyRegistry::default();

    // A stored record wins over the file: it carries the live status
    let mut entries = Vec::with_capacity(settings.strategies.len());
    for entry in settings.strategies {
        let record = match store.get_strategy(entry.record.id).await? {
            Some(stored) => stored,
            None => entry.record,
        };
        entries.push((entry.kind, record));
    }

    // The paper venue starts with an empty book, so a stored active ladder points
    // at orders that no longer exist. Tear those down before anything is placed.
    for (_, record) in entries.iter_mut() {
        if record.status != StrategyStatus::Active {
            continue;
        }
        warn!(
            "[{}] Strategy {:?} was active but its paper orders did not survive the restart, relaunching",
            record.id, record.name
        );
        let gateway = gateways.gateway_for(record)?;
        *record = halt_strategy(&engine, gateway, record.id).await?;
    }

    for (kind, record) in entries {
        let gateway = gateways.gateway_for(&record)?;
        let ctx = StrategyContext {
            store: store.clone(),
            gateway: gateway.clone(),
            recent_order_ttl: settings.engine.recent_order_ttl(),
            call_timeout: settings.engine.call_timeout(),
        };
        let strategy = registry.create_strategy(&kind, record.clone(), ctx)?;

        match launch_strategy(&engine, strategy, gateway).await {
            Ok(record) => info!("[{}] Strategy {:?} running", record.id, record.name),
            Err(e) => error!("[{}] Strategy {:?} did not start: {}", record.id, record.name, e),
        }
    }

    let driver = tokio::spawn({
        let venue = venue.clone();
        let paper = settings.paper;
        async move {
            let mut ticker = interval(Duration::from_millis(paper.step_interval_ms.max(1)));
            let mut step = 0u64;
            loop {
                ticker.tick().await;
                let price = oscillating_price(paper.initial_price, paper.amplitude, step, paper.period_steps);
                for symbol in &symbols {
                    venue.set_mark_price(symbol, price).await;
                }
                step += 1;
            }
        }
    });

    info!("Grid engine is now RUNNING, press Ctrl+C to stop");
    let result = engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await;

    driver.abort();
    result
}
