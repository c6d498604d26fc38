mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::Utc;
use common::{TestApp, TestOptions, WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use storefront_api::{
    entities::{AddressKind, OrderStatus, PaymentStatus},
    metrics,
    webhooks::{SignatureGenerator, REQUEST_ID_HEADER, SIGNATURE_HEADER},
};
use uuid::Uuid;

fn webhook(signature: Option<String>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json")
        .header(REQUEST_ID_HEADER, "req-wh-2");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn checkout_flow_end_to_end() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("HTTP-TEE", dec!(100.00), Some((dec!(80.00), Some(10))))
        .await;
    app.set_stock(product, 20).await;
    let user = Uuid::new_v4();
    let session = "sess-http";

    let (status, cart) = app
        .call(
            Method::POST,
            "/api/v1/cart/items",
            Some(user),
            session,
            Some(json!({"product_id": product, "qty": 10})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["lines"][0]["tier"], "wholesale");

    let (status, locked) = app.call(Method::POST, "/api/v1/cart/lock", Some(user), session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["reservations"].as_array().unwrap().len(), 1);
    assert_eq!(locked["cart"]["status"], "locked");

    let (status, started) = app
        .call(
            Method::POST,
            "/api/v1/checkout/start",
            Some(user),
            session,
            Some(json!({"shipping_address": {"city": "Rosario"}})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(started["status"], "pending");
    let order_number = started["order_number"].as_str().unwrap().to_string();
    let order_id: Uuid = serde_json::from_value(started["order_id"].clone()).unwrap();

    let shipping = app.seed_address(user, AddressKind::Shipping, true).await;
    let billing = app.seed_address(user, AddressKind::Billing, true).await;
    let base = format!("/api/v1/checkout/{order_number}/addresses");

    let (status, choices) = app.call(Method::GET, &base, Some(user), session, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(choices["can_continue"], true);

    let (status, selected) = app
        .call(
            Method::POST,
            &format!("{base}/select"),
            Some(user),
            session,
            Some(json!({"shipping_address_id": shipping, "billing_address_id": billing})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(selected["order_status"], "addresses_selected");

    let (status, confirmed) = app
        .call(Method::POST, &format!("{base}/confirm"), Some(user), session, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(confirmed["can_proceed_to_payment"], true);

    let (status, intent) = app
        .call(
            Method::POST,
            "/api/v1/payments/intents",
            Some(user),
            session,
            Some(json!({"order_number": order_number})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(intent["status"], "created");

    let (status, ack) = app
        .post_webhook(&json!({
            "type": "payment",
            "data": {"id": "PAY-HTTP-1", "status": "approved"},
            "external_reference": order_number,
        }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["order_status"], "paid");
    assert_eq!(ack["order_payment_status"], "approved");

    let order = app.order(order_id).await;
    assert_eq!(order.status, OrderStatus::Paid);
    assert_eq!(order.payment_status, PaymentStatus::Approved);
    let row = app.inventory(product).await;
    assert_eq!((row.on_hand, row.committed), (10, 0));
}

#[tokio::test]
async fn shortages_are_reported_as_conflict_details() {
    let app = TestApp::new().await;
    let product = app.seed_product("HTTP-LOW", dec!(5.00), None).await;
    app.set_stock(product, 1).await;

    app.call(
        Method::POST,
        "/api/v1/cart/items",
        None,
        "sess-low",
        Some(json!({"product_id": product, "qty": 3})),
    )
    .await;
    let (status, body) = app.call(Method::POST, "/api/v1/cart/lock", None, "sess-low", None).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "insufficient_stock");
    let shortage = &body["details"]["shortages"][0];
    assert_eq!(shortage["requested"], 3);
    assert_eq!(shortage["available"], 1);
    assert_eq!(shortage["missing"], 2);
}

#[tokio::test]
async fn second_start_returns_the_existing_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("HTTP-TWICE", dec!(5.00), None).await;
    app.set_stock(product, 5).await;
    let user = Uuid::new_v4();
    let summary = app.started_order(user, product, 1).await;

    let (status, body) = app
        .call(Method::POST, "/api/v1/checkout/start", Some(user), "sess-started", None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "order_already_started");
    assert_eq!(body["details"]["order_number"], summary.order_number.as_str());
    assert_eq!(body["details"]["order_id"], summary.order_id.to_string());
}

#[tokio::test]
async fn invalid_item_quantity_is_a_bad_request() {
    let app = TestApp::new().await;
    let product = app.seed_product("HTTP-ZERO", dec!(5.00), None).await;

    let (status, body) = app
        .call(
            Method::POST,
            "/api/v1/cart/items",
            None,
            "sess-zero",
            Some(json!({"product_id": product, "qty": 0})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
}

#[tokio::test]
async fn webhook_rejections_never_touch_the_order() {
    let app = TestApp::new().await;
    let product = app.seed_product("HTTP-WH", dec!(5.00), None).await;
    app.set_stock(product, 5).await;
    let order = app.confirmed_order(Uuid::new_v4(), product, 1).await;
    let body = json!({
        "data": {"id": "PAY-WH-1", "status": "approved"},
        "external_reference": order.order_number,
    });
    let now = Utc::now().timestamp();
    let generator = SignatureGenerator::new(WEBHOOK_SECRET);

    let (status, err) = app.request(webhook(None, &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "missing_signature_headers");

    let forged = SignatureGenerator::new("not-the-secret").header_value("PAY-WH-1", "req-wh-2", now);
    let (status, err) = app.request(webhook(Some(forged), &body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(err["code"], "invalid_signature");

    let stale = generator.header_value("PAY-WH-1", "req-wh-2", now - 3_600);
    let (status, err) = app.request(webhook(Some(stale), &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "signature_timestamp_out_of_window");

    // signed for a different payment than the body names
    let swapped = generator.header_value("PAY-OTHER", "req-wh-2", now);
    let (status, _) = app.request(webhook(Some(swapped), &body)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(app.metrics.get(metrics::WEBHOOK_REJECTED), 4);
    let stored = app.order(order.order_id).await;
    assert_eq!(stored.status, OrderStatus::AddressesSelected);
    assert_eq!(stored.payment_status, PaymentStatus::Pending);
    assert_eq!(app.inventory(product).await.committed, 1);
}

#[tokio::test]
async fn webhook_without_configured_secret_is_unauthorized() {
    let app = TestApp::with_options(TestOptions {
        webhook_secret: None,
        ..Default::default()
    })
    .await;

    let (status, err) = app
        .post_webhook(&json!({"data": {"id": "PAY-NOSECRET", "status": "approved"}}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["code"], "webhook_secret_not_configured");
}

#[tokio::test]
async fn address_routes_require_an_authenticated_user() {
    let app = TestApp::new().await;
    let (status, err) = app
        .call(Method::GET, "/api/v1/checkout/20240101-000001/addresses", None, "sess-x", None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(err["code"], "unauthorized");
}

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let (status, body) = app.call(Method::GET, "/api/v1/health", None, "sess-h", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "up");
}
