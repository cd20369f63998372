// HTTP surface for generation runs
// REST endpoints plus the server-push and duplex relays

pub mod auth;
pub mod handlers;
pub mod sse;
pub mod types;
pub mod websocket;

#[cfg(test)]
mod handler_tests;
#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::api::auth::AuthProvider;
use crate::api::websocket::RelayRegistry;
use crate::config::{RelaySettings, ServerSettings};
use crate::engine::channel::ProgressChannel;
use crate::engine::queue::JobQueue;
use crate::engine::storage::RunStore;
use handlers::{
    create_generation, get_generation, health_check, list_generations, not_found, submit_review,
};

/// Everything the handlers need, cheap to clone per request
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RunStore>,
    pub channel: Arc<dyn ProgressChannel>,
    pub queue: JobQueue,
    pub auth: Arc<dyn AuthProvider>,
    pub relays: RelayRegistry,
    pub relay: RelaySettings,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RunStore>,
        channel: Arc<dyn ProgressChannel>,
        queue: JobQueue,
        auth: Arc<dyn AuthProvider>,
        relay: RelaySettings,
    ) -> Self {
        let relays = RelayRegistry::new(channel.clone(), relay.channel_capacity);
        Self {
            store,
            channel,
            queue,
            auth,
            relays,
            relay,
        }
    }
}

/// Build the router for every public endpoint
pub fn create_router(state: AppState, cors_enabled: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/generations",
            post(create_generation).get(list_generations),
        )
        .route("/api/generations/:id", get(get_generation))
        .route("/api/generations/:id/review", post(submit_review))
        .route("/api/sse/generation/:run_id", get(sse::generation_stream))
        .route("/api/ws/generation", get(websocket::duplex_handler))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// HTTP server wrapping [`create_router`]
pub struct ForgeServer {
    settings: ServerSettings,
    state: AppState,
}

impl ForgeServer {
    pub fn new(settings: ServerSettings, state: AppState) -> Self {
        Self { settings, state }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), self.settings.cors_enabled)
    }

    /// Serve until the process exits
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let app = self.router();
        let addr = format!("{}:{}", self.settings.host, self.settings.port);

        info!("✍️ Article Forge server starting");
        info!("📡 Server address: http://{}", addr);
        info!("🔗 API endpoints:");
        info!("   POST http://{}/api/generations", addr);
        info!("   GET  http://{}/api/generations/:id", addr);
        info!("   POST http://{}/api/generations/:id/review", addr);
        info!("   GET  http://{}/api/sse/generation/:run_id", addr);
        info!("   GET  ws://{}/api/ws/generation?token=...", addr);
        info!("📋 CORS enabled: {}", self.settings.cors_enabled);

        axum::Server::bind(&addr.parse()?)
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::TestApp;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = TestApp::spawn().await;
        let response = create_router(app.state.clone(), false)
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_protected_routes_need_a_token() {
        let app = TestApp::spawn().await;
        let router = create_router(app.state.clone(), false);
        for uri in ["/api/generations", "/api/generations/abc", "/api/sse/generation/abc"] {
            let response = router
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_cors_preflight_when_enabled() {
        let app = TestApp::spawn().await;
        let response = create_router(app.state.clone(), true)
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/api/generations")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }
}
