use axum::{routing::delete, routing::get, routing::post, Router};

use crate::http::handlers;
use crate::AppState;

pub fn health() -> Router<AppState> {
    Router::new().route("/health", get(handlers::health))
}

pub fn auth() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh_token))
        .route("/auth/revoke", post(handlers::revoke_token))
        .route("/auth/me", get(handlers::get_current_user))
        .route(
            "/auth/password-reset/request",
            post(handlers::request_password_reset),
        )
        .route(
            "/auth/password-reset/confirm",
            post(handlers::confirm_password_reset),
        )
}

pub fn users() -> Router<AppState> {
    Router::new()
        .route("/users", post(handlers::create_user))
        .route("/users/:id", get(handlers::get_user))
}

pub fn items() -> Router<AppState> {
    Router::new()
        .route("/items", post(handlers::create_item))
        .route("/items", get(handlers::list_items))
        .route("/items/photo-upload", post(handlers::create_photo_upload))
        .route("/items/:id", get(handlers::get_item))
        .route("/items/:id", delete(handlers::delete_item))
        .route("/items/:id/purchase", post(handlers::purchase_item))
}

pub fn cart() -> Router<AppState> {
    Router::new()
        .route("/cart", get(handlers::get_cart))
        .route("/cart", post(handlers::add_to_cart))
        .route("/cart/:item_id", delete(handlers::remove_from_cart))
}

pub fn push_tokens() -> Router<AppState> {
    Router::new()
        .route("/push-tokens", post(handlers::register_push_token))
        .route("/push-tokens", delete(handlers::unregister_push_token))
}

pub fn notifications() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(handlers::list_notifications))
        .route(
            "/notifications/unread-count",
            get(handlers::unread_notification_count),
        )
        .route(
            "/notifications/read-all",
            post(handlers::mark_all_notifications_read),
        )
        .route(
            "/notifications/:id/read",
            post(handlers::mark_notification_read),
        )
}
