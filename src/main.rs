use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{error, info};

use group_locations::auth::AuthConfig;
use group_locations::broadcast::RoomHub;
use group_locations::config::{Config, StoreBackend};
use group_locations::database::PgStore;
use group_locations::memory_store::MemoryStore;
use group_locations::reconcile::spawn_reconciler;
use group_locations::routes::{setup_routes, AppState};
use group_locations::store::LocationStore;
use group_locations::sync::CacheSyncEngine;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = Config::new().map_err(|err| {
        error!("❌ configuration error: {:#}", err);
        std::io::Error::other(err.to_string())
    })?;

    info!("🚀 group locations server starting...");
    info!("📍 server address: http://{}", config.server_address());

    let store: Arc<dyn LocationStore> = match config.store_backend {
        StoreBackend::Memory => {
            info!("🗂️ using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            let store = PgStore::new(&config).await.map_err(|err| {
                error!("❌ database connection failed: {:#}", err);
                std::io::Error::other(err.to_string())
            })?;
            info!("✅ database connected");
            info!("🔒 writes are serialized in-process, run a single instance per database");
            Arc::new(store)
        }
    };

    let hub = Arc::new(RoomHub::new(config.broadcast_capacity));
    let engine = Arc::new(CacheSyncEngine::new(store, hub, config.uploads_prefix.clone()));
    let _reconciler = spawn_reconciler(engine.clone(), config.resync_interval());

    let state = web::Data::new(AppState::new(engine));
    let auth = web::Data::new(AuthConfig::new(&config.jwt_secret));

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .app_data(auth.clone())
            .configure(setup_routes)
    })
    .bind(config.server_address())?
    .run()
    .await
}
