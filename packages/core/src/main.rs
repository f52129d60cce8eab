use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use serde::Serialize;
use serde_json::json;

use carbon_metrics::cli::{Cli, Command};
use carbon_metrics::config::Config;
use carbon_metrics::content::{ContentId, ContentRepository, SqliteContentRepository};
use carbon_metrics::db::create_pool;
use carbon_metrics::error::AppError;
use carbon_metrics::format;
use carbon_metrics::jobs::{drain_pending, run_backlog_polling, run_worker};
use carbon_metrics::logging::init_logging;
use carbon_metrics::measurement::HttpMeasurementClient;
use carbon_metrics::metrics::AppMetrics;
use carbon_metrics::store::SqliteValueStore;
use carbon_metrics::CarbonMetrics;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    // Pure formatting needs neither config nor database.
    if let Command::Equivalents { grams } = cli.command {
        return print_json(&json!({
            "emissions": format::format_emissions(grams),
            "driving_distance": format::format_driving_distance(grams, 2),
            "trees_needed": format::format_trees_needed(grams),
        }));
    }

    let config = Config::from_env_with(cli.database_url, cli.measurement_api_url)
        .map_err(AppError::Config)?;
    tracing::debug!("Loaded config: {:?}", config);

    let pool = create_pool(&config.database_url).await?;
    let store = Arc::new(SqliteValueStore::new(pool.clone()));
    match store.purge_expired().await {
        Ok(purged) if purged > 0 => tracing::debug!("Purged {} expired store entries", purged),
        Ok(_) => {}
        Err(err) => tracing::warn!("Could not purge expired store entries: {}", err),
    }

    let repository: Arc<dyn ContentRepository> = Arc::new(SqliteContentRepository::new(pool));
    let measurer = Arc::new(HttpMeasurementClient::new(
        config.measurement_api_url.clone(),
        repository.clone(),
    ));
    let metrics = Arc::new(AppMetrics::new()?);

    let (service, mut receiver) =
        CarbonMetrics::new(store, repository, measurer, config.cache.clone());
    let service = service.with_metrics(metrics.clone());

    match cli.command {
        Command::Stats => print_json(&service.get_site_stats().await?)?,
        Command::Heaviest { limit } => print_json(&service.get_heaviest_pages(limit).await?)?,
        Command::Untested => print_json(&service.get_untested_pages().await?)?,
        Command::Emissions { id } => {
            let id = parse_id(id)?;
            let emissions = service.get_post_emissions(id).await?;
            let formatted = emissions.grams().map(format::format_emissions);
            print_json(&json!({
                "id": id,
                "emissions": emissions,
                "formatted": formatted,
            }))?;
        }
        Command::Schedule { ids } => {
            let mut outcomes = Vec::with_capacity(ids.len());
            for raw in ids {
                let id = parse_id(raw)?;
                let outcome = service.maybe_schedule_processing(id).await;
                outcomes.push(json!({ "id": id, "outcome": outcome }));
            }
            let processed = drain_pending(service.coordinator(), &mut receiver).await;
            tracing::info!("Processed {} queued jobs", processed);
            print_json(&outcomes)?;
        }
        Command::Worker { interval_secs } => {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
            let worker = tokio::spawn(run_worker(
                service.coordinator().clone(),
                receiver,
                config.worker_concurrency,
                async {
                    let _ = stop_rx.await;
                },
            ));

            run_backlog_polling(
                service.coordinator(),
                service.stats(),
                Duration::from_secs(interval_secs),
                async {
                    let _ = tokio::signal::ctrl_c().await;
                },
            )
            .await;

            let _ = stop_tx.send(());
            if let Err(err) = worker.await {
                tracing::error!("Worker task failed: {}", err);
            }
        }
        Command::Equivalents { .. } => {}
    }

    if cli.metrics {
        print!("{}", metrics.render()?);
    }

    Ok(())
}

fn parse_id(raw: u64) -> Result<ContentId, AppError> {
    ContentId::try_from(raw).map_err(AppError::InvalidInput)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
