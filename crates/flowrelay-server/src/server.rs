use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use flowrelay_store::{AcceptAll, FlowStore, FlowValidator};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{ConnectionHub, HubConfig};
use crate::routes;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<FlowStore>,
    pub validator: Arc<dyn FlowValidator>,
    pub hub: Arc<ConnectionHub>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let hub = ConnectionHub::new(HubConfig::from(&config));
        Self {
            store: Arc::new(FlowStore::new()),
            validator: Arc::new(AcceptAll),
            hub: Arc::new(hub),
            config: Arc::new(config),
        }
    }

    pub fn with_store(mut self, store: Arc<FlowStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn FlowValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);
    Router::new()
        .route("/api/flow", post(routes::save_flow))
        .route("/api/flow/{flow_id}", get(routes::load_flow))
        .route("/api/validate", post(routes::validate_flow))
        .route("/ws", get(routes::ws_handler))
        .route("/health", get(routes::health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// CORS for the configured origins. A `"*"` entry opens it to any origin,
/// which rules out credentials.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Start the server with a fresh store and the accept-all validator.
pub async fn start(config: ServerConfig) -> Result<ServerHandle, ServerError> {
    start_with(AppState::new(config)).await
}

/// Bind and serve `state`. Returns a handle to shut it down.
pub async fn start_with(state: AppState) -> Result<ServerHandle, ServerError> {
    state.config.validate()?;

    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let router = build_router(state.clone());

    let serve_token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { serve_token.cancelled().await })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "flowrelay server started");

    Ok(ServerHandle {
        local_addr,
        state,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.state.hub
    }

    pub fn store(&self) -> &Arc<FlowStore> {
        &self.state.store
    }

    /// Close every WebSocket, stop accepting requests and wait for the
    /// server task, up to the configured shutdown timeout.
    pub async fn shutdown(self) {
        let closed = self.state.hub.close_all();
        self.shutdown.cancel();
        tracing::info!(connections = closed, "Shutting down");

        let timeout = self.state.config.shutdown_timeout();
        if tokio::time::timeout(timeout, self.server).await.is_err() {
            tracing::warn!("shutdown timed out after {timeout:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let _router = build_router(AppState::new(test_config()));
    }

    #[test]
    fn cors_layer_accepts_wildcard_and_lists() {
        let _any = cors_layer(&["*".to_string()]);
        let _list = cors_layer(&["http://localhost".to_string(), "bad\norigin".to_string()]);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(test_config()).await.unwrap();
        assert!(handle.port() > 0);

        let url = format!("http://{}/health", handle.local_addr());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);
        assert_eq!(body["flows"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let config = ServerConfig {
            port: 0,
            max_send_queue: 0,
            ..Default::default()
        };
        assert!(matches!(start(config).await, Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn shared_store_is_visible_through_handle() {
        let store = Arc::new(FlowStore::new());
        let state = AppState::new(test_config()).with_store(Arc::clone(&store));
        let handle = start_with(state).await.unwrap();

        store.save(Default::default());
        assert!(handle.store().contains("current"));

        handle.shutdown().await;
    }
}
