pub mod auth;
pub mod broker;
pub mod directory;
pub mod error;
pub mod live;
pub mod notify;
pub mod routes;
pub mod service;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, patch};
use axum::Router;
use haat_config::Config;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::RoomBroker;
use crate::directory::{Directory, StaticDirectory};
use crate::notify::Notifier;
use crate::service::ChatService;
use crate::store::{StoreBackend, StoreLimits};

pub use error::ChatError;
pub use store::StoreError;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(router(state))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(routes::healthz))
        .route("/v1/chats", get(routes::list_chats).post(routes::open_chat))
        .route("/v1/chats/contacts", get(routes::list_contacts))
        .route(
            "/v1/chats/{id}/messages",
            get(routes::chat_messages).post(routes::send_message),
        )
        .route("/v1/chats/{id}/read", patch(routes::mark_read))
        .route("/v1/live", get(live::live))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub live: haat_config::Live,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self, String> {
        let store = StoreBackend::open(&cfg.store, StoreLimits::from_config(&cfg.chat))
            .map_err(|e| e.to_string())?;
        let directory: Arc<dyn Directory> = Arc::new(StaticDirectory::from_config(&cfg.directory));
        let broker = Arc::new(RoomBroker::new());
        let notifier = Notifier::new(
            &cfg.notifications,
            Arc::clone(&broker),
            Arc::clone(&directory),
        )
        .await?;
        info!(
            store = %cfg.store.kind,
            principals = cfg.directory.principals.len(),
            "chat service ready"
        );
        Ok(Self {
            chat: Arc::new(ChatService::new(
                cfg.chat,
                store,
                directory,
                broker,
                Arc::new(notifier),
            )),
            live: cfg.live,
        })
    }
}
