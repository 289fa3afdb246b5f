use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::app::auth::TokenPair;
use crate::app::cart::CartService;
use crate::app::items::{ItemService, NewItem};
use crate::app::market_events::{self, MarketEvent};
use crate::app::notifications::{NotificationService, DEFAULT_LIST_LIMIT};
use crate::app::password_reset::PasswordResetService;
use crate::app::push_tokens::{PushTokenService, TokenRegistration};
use crate::app::users::UserService;
use crate::domain::cart::CartEntry;
use crate::domain::item::{Item, ItemFilter};
use crate::domain::notification::NotificationRecord;
use crate::domain::push_token::{PushToken, TransportKind};
use crate::domain::user::{PublicUser, User};
use crate::infra::db::unique_violation;
use crate::infra::storage::PresignedUpload;
use crate::http::{AppError, AuthUser};
use crate::AppState;

const MAX_PASSWORD_LEN: usize = 128;
const MIN_PASSWORD_LEN: usize = 8;
const MAX_TITLE_LEN: usize = 120;
const MAX_DESCRIPTION_LEN: usize = 5000;
const MAX_CATEGORY_LEN: usize = 50;
const MAX_PRICE_CENTS: i64 = 100_000_000;

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
}

#[derive(Deserialize)]
pub struct PaginationQuery {
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

fn parse_limit(limit: Option<i64>, default: i64) -> Result<i64, AppError> {
    let limit = limit.unwrap_or(default);
    if !(1..=200).contains(&limit) {
        return Err(AppError::bad_request("limit must be between 1 and 200"));
    }
    Ok(limit)
}

fn parse_cursor(cursor: Option<String>) -> Result<Option<(OffsetDateTime, i64)>, AppError> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };

    let (timestamp, id) = cursor
        .split_once('/')
        .ok_or_else(|| AppError::bad_request("invalid cursor"))?;

    let timestamp = OffsetDateTime::parse(timestamp, &Rfc3339)
        .map_err(|_| AppError::bad_request("invalid cursor"))?;
    let id = id
        .parse::<i64>()
        .map_err(|_| AppError::bad_request("invalid cursor"))?;

    Ok(Some((timestamp, id)))
}

fn encode_cursor(cursor: Option<(OffsetDateTime, i64)>) -> Option<String> {
    let (timestamp, id) = cursor?;
    let timestamp = timestamp.format(&Rfc3339).ok()?;
    Some(format!("{}/{}", timestamp, id))
}

/// Trims a page fetched with `limit + 1` rows and derives the next cursor.
fn paginate<T>(
    mut rows: Vec<T>,
    limit: i64,
    key: impl Fn(&T) -> (OffsetDateTime, i64),
) -> ListResponse<T> {
    let next_cursor = if rows.len() > limit as usize {
        rows.truncate(limit as usize);
        rows.last().map(&key)
    } else {
        None
    };

    ListResponse {
        items: rows,
        next_cursor: encode_cursor(next_cursor),
    }
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let db = state.db.ping().await.is_ok();
    let redis = state.cache.ping().await.is_ok();
    let status = if db && redis { "ok" } else { "degraded" };

    Json(HealthResponse { status })
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthTokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub access_expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_expires_at: OffsetDateTime,
}

impl From<TokenPair> for AuthTokenResponse {
    fn from(tokens: TokenPair) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_expires_at: tokens.access_expires_at,
            refresh_expires_at: tokens.refresh_expires_at,
        }
    }
}

pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthTokenResponse>, AppError> {
    if payload.email.trim().is_empty() || payload.password.trim().is_empty() {
        return Err(AppError::bad_request("email and password are required"));
    }
    if payload.password.len() > MAX_PASSWORD_LEN {
        return Err(AppError::bad_request("password must be at most 128 characters"));
    }

    let tokens = state
        .auth_service()
        .login(&payload.email, &payload.password)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to login");
            AppError::internal("failed to login")
        })?;

    match tokens {
        Some(tokens) => Ok(Json(tokens.into())),
        None => Err(AppError::unauthorized("invalid credentials")),
    }
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh_token(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthTokenResponse>, AppError> {
    if payload.refresh_token.trim().is_empty() {
        return Err(AppError::bad_request("refresh_token is required"));
    }

    let tokens = state
        .auth_service()
        .refresh(&payload.refresh_token)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to refresh token");
            AppError::internal("failed to refresh token")
        })?;

    match tokens {
        Some(tokens) => Ok(Json(tokens.into())),
        None => Err(AppError::unauthorized("invalid refresh token")),
    }
}

pub async fn revoke_token(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<StatusCode, AppError> {
    if payload.refresh_token.trim().is_empty() {
        return Err(AppError::bad_request("refresh_token is required"));
    }

    state
        .auth_service()
        .revoke_refresh_token(&payload.refresh_token)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to revoke token");
            AppError::internal("failed to revoke token")
        })?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_current_user(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<User>, AppError> {
    let user = state
        .auth_service()
        .get_current_user(auth.user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to fetch current user");
            AppError::internal("failed to fetch current user")
        })?;

    match user {
        Some(user) => Ok(Json(user)),
        None => Err(AppError::not_found("user not found")),
    }
}

#[derive(Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

fn password_reset_service(state: &AppState) -> PasswordResetService {
    PasswordResetService::new(
        state.auth_service(),
        state.cache.clone(),
        state.mailer.clone(),
        state.reset_code_ttl_seconds,
    )
}

/// Answers 202 whether or not the account exists.
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<StatusCode, AppError> {
    if payload.email.trim().is_empty() {
        return Err(AppError::bad_request("email is required"));
    }

    password_reset_service(&state)
        .request(&payload.email)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to issue password reset code");
            AppError::internal("failed to request password reset")
        })?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub struct PasswordResetConfirmRequest {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

pub async fn confirm_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetConfirmRequest>,
) -> Result<StatusCode, AppError> {
    if payload.email.trim().is_empty() || payload.code.trim().is_empty() {
        return Err(AppError::bad_request("email and code are required"));
    }
    validate_password(&payload.new_password)?;

    let reset = password_reset_service(&state)
        .confirm(&payload.email, &payload.code, &payload.new_password)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to confirm password reset");
            AppError::internal("failed to reset password")
        })?;

    if reset {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::bad_request("invalid or expired reset code"))
    }
}

fn validate_password(password: &str) -> Result<(), AppError> {
    if password.trim().len() < MIN_PASSWORD_LEN {
        return Err(AppError::bad_request("password must be at least 8 characters"));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(AppError::bad_request("password must be at most 128 characters"));
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub handle: String,
    pub email: String,
    pub display_name: String,
    pub password: String,
}

pub async fn create_user(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    if payload.handle.trim().is_empty() {
        return Err(AppError::bad_request("handle cannot be empty"));
    }
    if !payload.email.contains('@') {
        return Err(AppError::bad_request("email is invalid"));
    }
    if payload.display_name.trim().is_empty() {
        return Err(AppError::bad_request("display_name cannot be empty"));
    }
    validate_password(&payload.password)?;

    let user = state
        .auth_service()
        .signup(
            payload.handle.trim().to_string(),
            payload.email,
            payload.display_name.trim().to_string(),
            payload.password,
        )
        .await
        .map_err(|err| {
            let constraint = err.downcast_ref::<sqlx::Error>().and_then(unique_violation);
            match constraint.as_deref() {
                Some(name) if name.contains("users_handle_key") => {
                    AppError::conflict("Handle already taken")
                }
                Some(name) if name.contains("users_email_key") => {
                    AppError::conflict("Email already taken")
                }
                _ => {
                    tracing::error!(error = ?err, "failed to create user");
                    AppError::internal("failed to create user")
                }
            }
        })?;

    tracing::info!(user_id = user.id, "user signed up");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<PublicUser>, AppError> {
    let user = UserService::new(state.db.clone())
        .get_public(id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = id, "failed to fetch user");
            AppError::internal("failed to fetch user")
        })?;

    match user {
        Some(user) => Ok(Json(user)),
        None => Err(AppError::not_found("user not found")),
    }
}

#[derive(Deserialize)]
pub struct CreateItemRequest {
    pub title: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub category: Option<String>,
    pub photo_key: Option<String>,
}

pub async fn create_item(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateItemRequest>,
) -> Result<(StatusCode, Json<Item>), AppError> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title cannot be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::bad_request("title must be at most 120 characters"));
    }
    if payload
        .description
        .as_ref()
        .is_some_and(|text| text.chars().count() > MAX_DESCRIPTION_LEN)
    {
        return Err(AppError::bad_request("description must be at most 5000 characters"));
    }
    if !(0..=MAX_PRICE_CENTS).contains(&payload.price_cents) {
        return Err(AppError::bad_request("price_cents is out of range"));
    }
    let category = payload
        .category
        .map(|category| category.trim().to_lowercase())
        .filter(|category| !category.is_empty());
    if category
        .as_ref()
        .is_some_and(|category| category.chars().count() > MAX_CATEGORY_LEN)
    {
        return Err(AppError::bad_request("category must be at most 50 characters"));
    }
    let owned_prefix = format!("items/{}/", auth.user_id);
    if payload
        .photo_key
        .as_ref()
        .is_some_and(|key| !key.starts_with(&owned_prefix))
    {
        return Err(AppError::bad_request("photo_key does not belong to you"));
    }

    let item = ItemService::new(state.db.clone())
        .publish(
            auth.user_id,
            NewItem {
                title: title.to_string(),
                description: payload.description,
                price_cents: payload.price_cents,
                category,
                photo_key: payload.photo_key,
            },
        )
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to create item");
            AppError::internal("failed to create item")
        })?;

    Ok((StatusCode::CREATED, Json(item)))
}

#[derive(Deserialize)]
pub struct ItemSearchQuery {
    pub q: Option<String>,
    pub category: Option<String>,
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
    pub seller_id: Option<i64>,
    #[serde(default)]
    pub include_sold: bool,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

pub async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ItemSearchQuery>,
) -> Result<Json<ListResponse<Item>>, AppError> {
    let limit = parse_limit(query.limit, 30)?;
    let cursor = parse_cursor(query.cursor)?;
    if let (Some(min), Some(max)) = (query.min_price_cents, query.max_price_cents) {
        if min > max {
            return Err(AppError::bad_request(
                "min_price_cents cannot exceed max_price_cents",
            ));
        }
    }

    let filter = ItemFilter {
        query: query.q,
        category: query.category.map(|category| category.trim().to_lowercase()),
        min_price_cents: query.min_price_cents,
        max_price_cents: query.max_price_cents,
        seller_id: query.seller_id,
        include_sold: query.include_sold,
    };

    let items = ItemService::new(state.db.clone())
        .search(&filter, cursor, limit + 1)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to search items");
            AppError::internal("failed to search items")
        })?;

    Ok(Json(paginate(items, limit, |item| (item.created_at, item.id))))
}

pub async fn get_item(
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<Item>, AppError> {
    let item = ItemService::new(state.db.clone())
        .get(id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, item_id = id, "failed to fetch item");
            AppError::internal("failed to fetch item")
        })?;

    match item {
        Some(item) => Ok(Json(item)),
        None => Err(AppError::not_found("item not found")),
    }
}

pub async fn delete_item(
    auth: AuthUser,
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    let withdrawal = ItemService::new(state.db.clone())
        .withdraw(id, auth.user_id)
        .await
        .map_err(|err| AppError::from_service(err, "delete item"))?;

    market_events::publish(
        &state.notifier,
        MarketEvent::ItemWithdrawn {
            item_id: withdrawal.item_id,
            title: withdrawal.title,
            seller_id: auth.user_id,
            cart_holders: withdrawal.cart_holders,
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn purchase_item(
    auth: AuthUser,
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<Item>, AppError> {
    let sale = ItemService::new(state.db.clone())
        .purchase(id, auth.user_id)
        .await
        .map_err(|err| AppError::from_service(err, "purchase item"))?;

    tracing::info!(item_id = id, buyer_id = auth.user_id, "item sold");

    market_events::publish(
        &state.notifier,
        MarketEvent::ItemSold {
            item_id: sale.item.id,
            title: sale.item.title.clone(),
            seller_id: sale.item.seller_id,
            buyer_id: auth.user_id,
            cart_holders: sale.cart_holders,
        },
    )
    .await;

    Ok(Json(sale.item))
}

#[derive(Deserialize)]
pub struct PhotoUploadRequest {
    pub content_type: String,
    pub bytes: i64,
}

pub async fn create_photo_upload(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<PhotoUploadRequest>,
) -> Result<Json<PresignedUpload>, AppError> {
    let extension = match payload.content_type.as_str() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        _ => return Err(AppError::bad_request("unsupported content type")),
    };
    if payload.bytes <= 0 {
        return Err(AppError::bad_request("bytes must be greater than 0"));
    }
    if payload.bytes > state.upload_max_bytes {
        return Err(AppError::bad_request("upload exceeds max size"));
    }

    let object_key = format!("items/{}/{}.{}", auth.user_id, Uuid::new_v4(), extension);
    let upload = state
        .storage
        .presign_put(
            object_key,
            &payload.content_type,
            payload.bytes,
            state.upload_url_ttl_seconds,
        )
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to presign upload");
            AppError::internal("failed to create upload")
        })?;

    Ok(Json(upload))
}

pub async fn get_cart(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<CartEntry>>, AppError> {
    let entries = CartService::new(state.db.clone())
        .list(auth.user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to list cart");
            AppError::internal("failed to list cart")
        })?;

    Ok(Json(entries))
}

#[derive(Deserialize)]
pub struct AddToCartRequest {
    pub item_id: i64,
}

pub async fn add_to_cart(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<AddToCartRequest>,
) -> Result<(StatusCode, Json<Item>), AppError> {
    let addition = CartService::new(state.db.clone())
        .add(auth.user_id, payload.item_id)
        .await
        .map_err(|err| AppError::from_service(err, "add to cart"))?;

    if !addition.newly_added {
        return Ok((StatusCode::OK, Json(addition.item)));
    }

    market_events::publish(
        &state.notifier,
        MarketEvent::AddedToCart {
            item_id: addition.item.id,
            title: addition.item.title.clone(),
            seller_id: addition.item.seller_id,
            shopper_id: auth.user_id,
        },
    )
    .await;

    Ok((StatusCode::CREATED, Json(addition.item)))
}

pub async fn remove_from_cart(
    auth: AuthUser,
    Path(item_id): Path<i64>,
    State(state): State<AppState>,
) -> Result<StatusCode, AppError> {
    let removed = CartService::new(state.db.clone())
        .remove(auth.user_id, item_id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, item_id, "failed to remove from cart");
            AppError::internal("failed to remove from cart")
        })?;

    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("item not in cart"))
    }
}

#[derive(Deserialize)]
pub struct RegisterPushTokenRequest {
    pub token: String,
    pub platform: Option<String>,
    pub transport: Option<String>,
}

pub async fn register_push_token(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<RegisterPushTokenRequest>,
) -> Result<Json<PushToken>, AppError> {
    let explicit_kind = match payload.transport.as_deref() {
        None => None,
        Some(value) => Some(
            TransportKind::from_db(&value.trim().to_lowercase())
                .ok_or_else(|| AppError::bad_request("transport must be expo or fcm"))?,
        ),
    };

    let registration = TokenRegistration {
        user_id: auth.user_id,
        token_value: payload.token,
        platform: payload.platform,
        explicit_kind,
    };

    let token = PushTokenService::new(state.db.clone())
        .register(registration)
        .await
        .map_err(|err| AppError::from_service(err, "register push token"))?;

    Ok(Json(token))
}

#[derive(Deserialize)]
pub struct UnregisterPushTokenRequest {
    pub token: String,
}

pub async fn unregister_push_token(
    auth: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<UnregisterPushTokenRequest>,
) -> Result<StatusCode, AppError> {
    if payload.token.trim().is_empty() {
        return Err(AppError::bad_request("token is required"));
    }

    let removed = PushTokenService::new(state.db.clone())
        .unregister(auth.user_id, payload.token.trim())
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to unregister push token");
            AppError::internal("failed to unregister push token")
        })?;

    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found("push token not found"))
    }
}

pub async fn list_notifications(
    auth: AuthUser,
    State(state): State<AppState>,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<ListResponse<NotificationRecord>>, AppError> {
    let limit = parse_limit(query.limit, DEFAULT_LIST_LIMIT)?;
    let cursor = parse_cursor(query.cursor)?;

    let records = NotificationService::new(state.db.clone())
        .list_for(auth.user_id, cursor, limit + 1)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to list notifications");
            AppError::internal("failed to list notifications")
        })?;

    Ok(Json(paginate(records, limit, |record| {
        (record.created_at, record.id)
    })))
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub unread: i64,
}

pub async fn unread_notification_count(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UnreadCountResponse>, AppError> {
    let unread = NotificationService::new(state.db.clone())
        .unread_count(auth.user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to count notifications");
            AppError::internal("failed to count notifications")
        })?;

    Ok(Json(UnreadCountResponse { unread }))
}

pub async fn mark_notification_read(
    auth: AuthUser,
    Path(id): Path<i64>,
    State(state): State<AppState>,
) -> Result<Json<NotificationRecord>, AppError> {
    let record = NotificationService::new(state.db.clone())
        .mark_read_owned(id, auth.user_id)
        .await
        .map_err(|err| AppError::from_service(err, "mark notification read"))?;

    Ok(Json(record))
}

#[derive(Serialize)]
pub struct MarkAllReadResponse {
    pub updated: u64,
}

pub async fn mark_all_notifications_read(
    auth: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<MarkAllReadResponse>, AppError> {
    let updated = NotificationService::new(state.db.clone())
        .mark_all_read(auth.user_id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, user_id = auth.user_id, "failed to mark notifications read");
            AppError::internal("failed to mark notifications read")
        })?;

    Ok(Json(MarkAllReadResponse { updated }))
}
