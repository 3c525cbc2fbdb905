//! QuantumForge daemon: open the stores, wire the engines, serve the
//! control-plane API until shutdown.

use anyhow::{Context, Result};
use dotenv::dotenv;
use parking_lot::RwLock;
use quantumforge::api::{self, AppState};
use quantumforge::config::{self, AppConfig};
use quantumforge::esi::{EsiClient, EsiTransport, FetchStatusTracker, TokenManager};
use quantumforge::industry::{CostEngine, LruCache};
use quantumforge::pricing::realistic::Pricer;
use quantumforge::sde::SdeReader;
use quantumforge::store::character::CharacterStore;
use quantumforge::store::market::MarketStore;
use quantumforge::store::plan::PlanStore;
use quantumforge::store::{migrations, Db};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Depth-0 cost results kept in memory.
const CALC_CACHE_CAPACITY: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quantumforge=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_dir = config::config_dir();
    config::ensure_config_dir(&config_dir).context("preparing config directory")?;
    let app_config = AppConfig::load(&config_dir).context("loading configuration")?;
    info!(dir = %config_dir.display(), "configuration loaded");

    // A failed migration is fatal; a missing SDE only blocks cost workflows.
    let character_db = Db::open(
        &AppConfig::resolve_path(&config_dir, &app_config.general.character_db),
        &migrations::character_migrations(),
    )
    .context("opening character database")?;
    let market_db = Db::open(
        &AppConfig::resolve_path(&config_dir, &app_config.general.market_db),
        &migrations::market_migrations(),
    )
    .context("opening market database")?;

    let characters = CharacterStore::new(character_db.clone());
    let market = MarketStore::new(market_db);

    let sde_dir = AppConfig::resolve_path(&config_dir, &app_config.general.sde_dir);
    let sde = open_sde(&sde_dir);

    let status = Arc::new(FetchStatusTracker::new());
    let http = EsiTransport::build(&app_config.general.user_agent)
        .context("building HTTP client")?;
    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        characters.clone(),
        app_config.general.oauth_client_id.clone(),
    ));
    let transport = EsiTransport::new(
        http,
        quantumforge::esi::DEFAULT_BASE_URL.to_string(),
        status,
    );
    let esi = Arc::new(EsiClient::new(transport, tokens));

    let pricer = Arc::new(Pricer::new(market.clone(), Some(esi.clone())));

    let (engine, plans) = match &sde {
        Some(sde) => {
            let engine = Arc::new(CostEngine::new(
                sde.clone(),
                Arc::new(LruCache::new(CALC_CACHE_CAPACITY)),
            ));
            let plans = Arc::new(PlanStore::new(
                character_db,
                characters.clone(),
                engine.clone(),
            ));
            (Some(engine), Some(plans))
        }
        None => (None, None),
    };

    let listen_port = app_config.general.listen_port;
    let state = AppState {
        characters,
        market,
        pricer,
        esi: Some(esi),
        sde,
        engine,
        plans,
        config: Arc::new(RwLock::new(app_config)),
        config_dir,
    };

    let router = api::router(state);
    let addr = format!("127.0.0.1:{listen_port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "control-plane API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving API")?;
    info!("shut down cleanly");
    Ok(())
}

fn open_sde(dir: &Path) -> Option<Arc<SdeReader>> {
    match SdeReader::resolve(dir).and_then(|path| SdeReader::open(&path)) {
        Ok(reader) => Some(Arc::new(reader)),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "SDE unavailable; cost workflows disabled");
            None
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
