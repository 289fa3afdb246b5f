//! Push token registration, fan-out through the fake providers, and the
//! in-app notification inbox.

mod common;

use axum::http::StatusCode;
use bazaar::domain::notification::PushMessage;
use common::app;
use serde_json::json;

async fn token_exists(token: &str) -> bool {
    let app = app().await;
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM push_tokens WHERE token_value = $1)")
        .bind(token)
        .fetch_one(app.state.db.pool())
        .await
        .expect("token lookup failed")
}

// ===========================================================================
// Token registration
// ===========================================================================

#[tokio::test]
async fn register_infers_transport_from_token() {
    let app = app().await;
    let user = app.create_user("tok_infer").await;

    let expo = app
        .post_json(
            "/v1/push-tokens",
            json!({ "token": "ExponentPushToken[infer-1]", "platform": "ios" }),
            Some(&user.access_token),
        )
        .await;
    assert_eq!(expo.status, StatusCode::OK);
    assert_eq!(expo.json()["transport_kind"], "expo");
    assert_eq!(expo.json()["owner_user_id"], user.id);

    let fcm = app
        .post_json(
            "/v1/push-tokens",
            json!({ "token": "fcm-infer-token-1", "platform": "android" }),
            Some(&user.access_token),
        )
        .await;
    assert_eq!(fcm.status, StatusCode::OK);
    assert_eq!(fcm.json()["transport_kind"], "fcm");
}

#[tokio::test]
async fn register_rejects_blank_token_and_unknown_transport() {
    let app = app().await;
    let user = app.create_user("tok_invalid").await;

    let blank = app
        .post_json(
            "/v1/push-tokens",
            json!({ "token": "   " }),
            Some(&user.access_token),
        )
        .await;
    assert_eq!(blank.status, StatusCode::BAD_REQUEST);
    assert_eq!(blank.error_message(), "token is required");

    let unknown = app
        .post_json(
            "/v1/push-tokens",
            json!({ "token": "abc", "transport": "carrier-pigeon" }),
            Some(&user.access_token),
        )
        .await;
    assert_eq!(unknown.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reregistering_moves_token_to_new_owner() {
    let app = app().await;
    let first = app.create_user("tok_move_a").await;
    let second = app.create_user("tok_move_b").await;
    let token = "ExponentPushToken[moving-device]";

    app.register_token(&first, token).await;
    app.register_token(&second, token).await;

    let owner: i64 =
        sqlx::query_scalar("SELECT owner_user_id FROM push_tokens WHERE token_value = $1")
            .bind(token)
            .fetch_one(app.state.db.pool())
            .await
            .unwrap();
    assert_eq!(owner, second.id);

    // The previous owner can no longer unregister it.
    let resp = app
        .delete_json(
            "/v1/push-tokens",
            json!({ "token": token }),
            Some(&first.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);

    let resp = app
        .delete_json(
            "/v1/push-tokens",
            json!({ "token": token }),
            Some(&second.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::NO_CONTENT);
    assert!(!token_exists(token).await);
}

// ===========================================================================
// Fan-out triggered by marketplace events
// ===========================================================================

#[tokio::test]
async fn purchase_pushes_to_seller_and_records_inbox_entry() {
    let app = app().await;
    let seller = app.create_user("fan_sale_seller").await;
    let buyer = app.create_user("fan_sale_buyer").await;
    let token = "ExponentPushToken[sale-seller]";
    app.register_token(&seller, token).await;

    let item_id = app.create_item(&seller, "Oak desk", 12_000).await;
    let resp = app
        .post_empty(
            &format!("/v1/items/{}/purchase", item_id),
            Some(&buyer.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK, "{:?}", resp.json());

    let sent = app.expo.sent_to(token);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Item sold");
    assert!(sent[0].body.contains("Oak desk"));

    let inbox = app.get("/v1/notifications", Some(&seller.access_token)).await;
    assert_eq!(inbox.status, StatusCode::OK);
    let items = inbox.json()["items"].as_array().cloned().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["title"], "Item sold");
    assert_eq!(items[0]["read"], false);
    assert_eq!(items[0]["data"]["type"], "item_sold");
    assert_eq!(items[0]["data"]["item_id"], item_id);

    // The buyer caused the sale and gets nothing.
    let buyer_inbox = app.get("/v1/notifications", Some(&buyer.access_token)).await;
    assert!(buyer_inbox.json()["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cart_addition_routes_fcm_tokens_to_fcm() {
    let app = app().await;
    let seller = app.create_user("fan_cart_seller").await;
    let shopper = app.create_user("fan_cart_shopper").await;
    let token = "fcm-cart-seller-device";
    app.register_token(&seller, token).await;

    let item_id = app.create_item(&seller, "Lamp", 2_500).await;
    let resp = app
        .post_json(
            "/v1/cart",
            json!({ "item_id": item_id }),
            Some(&shopper.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::CREATED);

    let sent = app.fcm.sent_to(token);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].title, "Someone wants your item");
    assert!(app.expo.sent_to(token).is_empty());

    // Adding again is a no-op and does not notify twice.
    let again = app
        .post_json(
            "/v1/cart",
            json!({ "item_id": item_id }),
            Some(&shopper.access_token),
        )
        .await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(app.fcm.sent_to(token).len(), 1);
}

#[tokio::test]
async fn invalid_destination_token_is_revoked() {
    let app = app().await;
    let seller = app.create_user("fan_invalid_seller").await;
    let buyer = app.create_user("fan_invalid_buyer").await;
    let dead = "ExponentPushToken[dead-device]";
    let live = "ExponentPushToken[live-device]";
    app.register_token(&seller, dead).await;
    app.register_token(&seller, live).await;
    app.expo.mark_invalid(dead);

    let item_id = app.create_item(&seller, "Chair", 4_000).await;
    let resp = app
        .post_empty(
            &format!("/v1/items/{}/purchase", item_id),
            Some(&buyer.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    assert!(!token_exists(dead).await);
    assert!(token_exists(live).await);

    let unread = app
        .get("/v1/notifications/unread-count", Some(&seller.access_token))
        .await;
    assert_eq!(unread.json()["unread"], 1);
}

#[tokio::test]
async fn users_without_tokens_still_get_inbox_records() {
    let app = app().await;
    let seller = app.create_user("fan_notokens_seller").await;
    let holder = app.create_user("fan_notokens_holder").await;
    let buyer = app.create_user("fan_notokens_buyer").await;

    let item_id = app.create_item(&seller, "Bookshelf", 8_000).await;
    let added = app
        .post_json(
            "/v1/cart",
            json!({ "item_id": item_id }),
            Some(&holder.access_token),
        )
        .await;
    assert_eq!(added.status, StatusCode::CREATED);

    let resp = app
        .post_empty(
            &format!("/v1/items/{}/purchase", item_id),
            Some(&buyer.access_token),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);

    let holder_inbox = app.get("/v1/notifications", Some(&holder.access_token)).await;
    let items = holder_inbox.json()["items"].as_array().cloned().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["data"]["type"], "item_unavailable");

    let cart = app.get("/v1/cart", Some(&holder.access_token)).await;
    assert!(cart.json().as_array().unwrap().is_empty());

    // Seller: one for the cart addition, one for the sale.
    let seller_unread = app
        .get("/v1/notifications/unread-count", Some(&seller.access_token))
        .await;
    assert_eq!(seller_unread.json()["unread"], 2);
}

#[tokio::test]
async fn notifier_reports_per_recipient_counts() {
    let app = app().await;
    let a = app.create_user("fan_report_a").await;
    let b = app.create_user("fan_report_b").await;
    app.register_token(&a, "ExponentPushToken[report-a]").await;
    app.register_token(&b, "fcm-report-b").await;

    let report = app
        .state
        .notifier
        .notify(&[a.id, b.id, a.id], &PushMessage::new("Hello", "Direct"))
        .await
        .expect("notify failed");

    assert_eq!(report.targeted, 2);
    assert_eq!(report.tokens_attempted, 2);
    assert_eq!(report.delivered, 2);
    assert!(report.record_write_failures.is_empty());
}

#[tokio::test]
async fn notifier_reports_record_failure_for_unknown_user() {
    let app = app().await;
    let known = app.create_user("fan_unknown_known").await;

    let report = app
        .state
        .notifier
        .notify(&[known.id, 987_654_321], &PushMessage::new("Hi", "There"))
        .await
        .expect("notify failed");

    assert_eq!(report.targeted, 2);
    assert_eq!(report.record_write_failures, vec![987_654_321]);
}

// ===========================================================================
// Inbox
// ===========================================================================

#[tokio::test]
async fn mark_read_is_idempotent_and_owner_scoped() {
    let app = app().await;
    let owner = app.create_user("inbox_read_owner").await;
    let other = app.create_user("inbox_read_other").await;

    app.state
        .notifier
        .notify(&[owner.id], &PushMessage::new("Ping", "One"))
        .await
        .unwrap();

    let inbox = app.get("/v1/notifications", Some(&owner.access_token)).await;
    let id = inbox.json()["items"][0]["id"].as_i64().unwrap();
    let path = format!("/v1/notifications/{}/read", id);

    let foreign = app.post_empty(&path, Some(&other.access_token)).await;
    assert_eq!(foreign.status, StatusCode::NOT_FOUND);

    let first = app.post_empty(&path, Some(&owner.access_token)).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.json()["read"], true);

    let second = app.post_empty(&path, Some(&owner.access_token)).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.json()["read"], true);

    let missing = app
        .post_empty("/v1/notifications/999999999/read", Some(&owner.access_token))
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.error_message(), "notification not found");
}

#[tokio::test]
async fn read_all_clears_unread_count() {
    let app = app().await;
    let user = app.create_user("inbox_read_all").await;

    for n in 0..3 {
        app.state
            .notifier
            .notify(&[user.id], &PushMessage::new("Ping", format!("#{}", n)))
            .await
            .unwrap();
    }

    let unread = app
        .get("/v1/notifications/unread-count", Some(&user.access_token))
        .await;
    assert_eq!(unread.json()["unread"], 3);

    let resp = app
        .post_empty("/v1/notifications/read-all", Some(&user.access_token))
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.json()["updated"], 3);

    let unread = app
        .get("/v1/notifications/unread-count", Some(&user.access_token))
        .await;
    assert_eq!(unread.json()["unread"], 0);
}

#[tokio::test]
async fn inbox_pages_newest_first() {
    let app = app().await;
    let user = app.create_user("inbox_pages").await;

    for n in 0..3 {
        app.state
            .notifier
            .notify(&[user.id], &PushMessage::new("Page", format!("{}", n)))
            .await
            .unwrap();
    }

    let first = app
        .get("/v1/notifications?limit=2", Some(&user.access_token))
        .await;
    assert_eq!(first.status, StatusCode::OK);
    let body = first.json();
    let page = body["items"].as_array().unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0]["body"], "2");
    assert_eq!(page[1]["body"], "1");
    let cursor = body["next_cursor"].as_str().unwrap().to_string();

    let second = app
        .get(
            &format!("/v1/notifications?limit=2&cursor={}", cursor.replace('+', "%2B")),
            Some(&user.access_token),
        )
        .await;
    let body = second.json();
    let page = body["items"].as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["body"], "0");
    assert!(body["next_cursor"].is_null());

    let bad_limit = app
        .get("/v1/notifications?limit=0", Some(&user.access_token))
        .await;
    assert_eq!(bad_limit.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn store_mark_read_keeps_first_read_time() {
    use bazaar::app::notifications::NotificationService;

    let app = app().await;
    let user = app.create_user("inbox_store_read").await;
    let store = NotificationService::new(app.state.db.clone());

    app.state
        .notifier
        .notify(&[user.id], &PushMessage::new("Store", "Direct"))
        .await
        .unwrap();
    let records = store.list_for(user.id, None, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].read);

    let first = store.mark_read(records[0].id).await.unwrap();
    assert!(first.read);
    let first_read_at: Option<time::OffsetDateTime> =
        sqlx::query_scalar("SELECT read_at FROM notifications WHERE id = $1")
            .bind(records[0].id)
            .fetch_one(app.state.db.pool())
            .await
            .unwrap();

    store.mark_read(records[0].id).await.unwrap();
    let second_read_at: Option<time::OffsetDateTime> =
        sqlx::query_scalar("SELECT read_at FROM notifications WHERE id = $1")
            .bind(records[0].id)
            .fetch_one(app.state.db.pool())
            .await
            .unwrap();
    assert_eq!(first_read_at, second_read_at);

    assert!(store.mark_read(-1).await.is_err());
}
