mod advisor;
mod api;
mod clock;
mod config;
mod http;
mod lifecycle;
mod llm;
mod matching;
mod metrics;
mod models;
mod scheduler;
mod scraper;
mod scraping;
mod security;
mod store;
mod tasks;

use advisor::{AdvisorService, HeuristicAdvisor, ListingAnalyzer, LlmAdvisor, Valuator};
use api::AppState;
use clock::{Clock, SystemClock};
use config::{AppConfig, ScraperBackend, SeedUser};
use eyre::WrapErr;
use llm::LlmClient;
use metrics_exporter_prometheus::PrometheusBuilder;
use models::User;
use scheduler::Scheduler;
use scraper::{DemoScraper, MarketplaceScraper, OlxScraper};
use scraping::ScrapeRunner;
use security::AuthState;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryStore, Store, StoreError, SupabaseStore};
use tasks::{MemoryTaskStore, RedisTaskStore, TaskDeps, TaskQueue, TaskStore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "buysmart.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let config = AppConfig::from_env();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn Store> = match &config.supabase {
        Some(supabase) => {
            info!(target = "buysmart.api", url = %supabase.url, "using supabase store");
            Arc::new(SupabaseStore::new(&supabase.url, supabase.service_key.clone()))
        }
        None => {
            warn!(target = "buysmart.api", "SUPABASE_URL not set, data lives in memory");
            Arc::new(MemoryStore::new())
        }
    };
    seed_users(store.as_ref(), clock.as_ref(), &config.seed_users).await;

    let scraper: Arc<dyn MarketplaceScraper> = match config.scraper_backend {
        ScraperBackend::Demo => Arc::new(DemoScraper::default()),
        ScraperBackend::Olx => Arc::new(
            OlxScraper::new(config.olx.clone()).wrap_err("compiling OLX selectors")?,
        ),
    };
    let runner = ScrapeRunner::new(store.clone(), scraper, clock.clone(), config.scrape);

    let llm = Arc::new(LlmClient::new(config.llm.clone()));
    let analyzer: Arc<dyn ListingAnalyzer>;
    let valuator: Arc<dyn Valuator>;
    if llm.is_configured() {
        let advisor = Arc::new(LlmAdvisor::new(llm));
        analyzer = advisor.clone();
        valuator = advisor;
    } else {
        warn!(target = "buysmart.api", "no LLM gateway configured, using heuristics");
        analyzer = Arc::new(HeuristicAdvisor);
        valuator = Arc::new(HeuristicAdvisor);
    }
    let advisor = AdvisorService::new(store.clone(), analyzer, valuator, clock.clone());

    let task_store: Arc<dyn TaskStore> = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str()).wrap_err("parsing REDIS_URL")?;
            Arc::new(RedisTaskStore::new(client, config.task_ttl_secs))
        }
        None => Arc::new(MemoryTaskStore::new(chrono::Duration::seconds(
            config.task_ttl_secs as i64,
        ))),
    };
    let (queue, _worker) = TaskQueue::spawn(
        TaskDeps {
            runner: runner.clone(),
            advisor: advisor.clone(),
            tasks: task_store,
            clock: clock.clone(),
        },
        config.queue_capacity,
    );

    let shutdown = CancellationToken::new();
    let scheduler = config.scheduler_enabled.then(|| {
        Scheduler::new(
            store.clone(),
            runner.clone(),
            clock.clone(),
            config.scheduler,
        )
        .spawn(shutdown.clone())
    });
    if scheduler.is_none() {
        info!(target = "buysmart.scheduler", "scheduler disabled");
    }

    let openapi: serde_json::Value = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| serde_json::json!({"openapi": "3.0.3"}));
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        store: store.clone(),
        runner,
        advisor,
        queue,
        clock,
        openapi: Arc::new(openapi),
        prometheus,
        metrics_key: config.metrics_key.clone(),
        openapi_key: config.openapi_key.clone(),
    };
    let auth = AuthState::new(store, config.rate_limit);
    let app = api::router(state, auth, config.body_limit);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    info!(target = "buysmart.api", "listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler
        && let Err(err) = handle.await
    {
        warn!(target = "buysmart.scheduler", error = %err, "scheduler task ended abnormally");
    }
    info!(target = "buysmart.api", "shutdown complete");
    Ok(())
}

async fn seed_users(store: &dyn Store, clock: &dyn Clock, seeds: &[SeedUser]) {
    for seed in seeds {
        match store.user_by_api_key(&seed.api_key).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => {
                warn!(target = "buysmart.api", email = %seed.email, error = %err, "seed lookup failed");
                continue;
            }
        }
        let now = clock.now();
        let user = User {
            id: Uuid::new_v4(),
            email: seed.email.to_ascii_lowercase(),
            api_key: seed.api_key.clone(),
            created_at: now,
            updated_at: now,
        };
        match store.create_user(user).await {
            Ok(user) => info!(target = "buysmart.api", user_id = %user.id, "seed user created"),
            Err(StoreError::Conflict(_)) => {
                warn!(target = "buysmart.api", email = %seed.email, "seed email taken with another key")
            }
            Err(err) => warn!(target = "buysmart.api", email = %seed.email, error = %err, "seed user failed"),
        }
    }
}

/// Resolves on ctrl-c or SIGTERM, or when something else cancels `token`.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "buysmart.api", error = %err, "ctrl-c handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "buysmart.api", error = %err, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = token.cancelled() => {},
    }
    info!(target = "buysmart.api", "shutdown signal received");
    token.cancel();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
