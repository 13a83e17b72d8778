use axum::middleware;
use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::auth_middleware;
use crate::desktop::{desktop_provision, desktop_status};
use crate::rest::health;
use crate::state::AppState;
use crate::tunnel::{desktop_tunnel, dev_proxy};
use crate::ws::handler::ws_upgrade;

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<axum::http::HeaderValue> = state
        .config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
        .allow_credentials(true);

    // Public routes (no auth required)
    let public_routes = Router::new().route("/healthz", get(health::health));

    // Control routes (auth required)
    let control_routes = Router::new()
        .route("/api/desktop/status", get(desktop_status))
        .route("/api/desktop/provision", post(desktop_provision))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Upgrade surfaces authenticate inside their handlers (query token,
    // cookie, or bearer).
    let upgrade_routes = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/tunnel/desktop", get(desktop_tunnel))
        .route("/tunnel/dev", any(dev_proxy))
        .route("/tunnel/dev/{*path}", any(dev_proxy));

    Router::new()
        .merge(public_routes)
        .merge(control_routes)
        .merge(upgrade_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
