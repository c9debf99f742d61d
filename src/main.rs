mod blob;
mod config;
mod content;
mod envelope;
mod identity;
mod ingest;
mod media;
mod middleware;
mod phone;
mod realtime;
mod store;
mod supervisor;
mod transport;

mod db;
mod error;
mod models;
mod routes;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use crate::{
    blob::DiskBlobStore,
    config::Config,
    middleware::clinic_context::CLINIC_HEADER,
    identity::{ContactBook, IdentityResolver},
    ingest::MessageIngester,
    media::MediaOffloader,
    models::AppState,
    phone::PhoneNormalizer,
    realtime::RealtimeBroadcaster,
    store::Store,
    supervisor::{ConnectionSupervisor, SupervisorConfig, session_channel},
    transport::{
        Transport,
        bridge::{BridgeConfig, BridgeTransport},
    },
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url).await?;
    if cfg.run_migrations {
        db::run_migrations(&pool).await?;
        tracing::info!("migrations applied");
    }

    let store: Arc<dyn Store> = Arc::new(db::PgStore::new(pool));
    let transport: Arc<dyn Transport> = Arc::new(BridgeTransport::new(BridgeConfig {
        command: cfg.bridge_command.clone(),
        script: cfg.bridge_script.clone().into(),
        auth_dir: cfg.auth_dir.clone(),
        request_timeout: cfg.request_timeout,
    }));

    tokio::fs::create_dir_all(&cfg.media_dir).await?;
    let blobs = Arc::new(DiskBlobStore::new(&cfg.media_dir, &cfg.media_public_url));
    let media_root = blobs.root().to_path_buf();

    let phones = PhoneNormalizer::default();
    let contacts = Arc::new(ContactBook::new());
    let (session_tx, session_rx) = session_channel();
    let realtime = RealtimeBroadcaster::new(session_rx);

    let resolver = IdentityResolver::new(
        store.clone(),
        transport.clone(),
        phones.clone(),
        contacts.clone(),
    );
    let ingester = MessageIngester::new(
        store.clone(),
        resolver,
        MediaOffloader::new(transport.clone(), blobs),
        realtime.clone(),
        cfg.clinic_id,
    );

    let supervisor = ConnectionSupervisor::spawn(
        transport.clone(),
        ingester,
        contacts,
        realtime.clone(),
        session_tx,
        SupervisorConfig {
            auth_dir: cfg.auth_dir.clone(),
            reconnect_delay: cfg.reconnect_delay,
            logout_restart_delay: cfg.logout_restart_delay,
        },
    );

    if cfg.autostart {
        if let Err(e) = supervisor.init().await {
            tracing::error!(error = %e, "whatsapp autostart failed, waiting for POST /init");
        }
    }

    let state = AppState {
        store,
        transport,
        supervisor: supervisor.clone(),
        realtime,
        phones,
        default_clinic_id: cfg.clinic_id,
    };

    // The dashboard is served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            header::HeaderName::from_static(CLINIC_HEADER),
        ]);

    let app = routes::router(state)
        .nest_service("/media", ServeDir::new(media_root))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await?;

    supervisor.shutdown().await;
    Ok(())
}
