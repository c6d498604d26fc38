mod common;

use assert_matches::assert_matches;
use common::{customer, seller, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use storefront_api::{
    auth::CartIdentity,
    entities::{product, CartStatus, PriceTier},
    errors::{ConflictKind, ServiceError},
    metrics,
    policy::StrictnessPolicy,
    rate_limiter::RateLimiter,
};
use uuid::Uuid;

#[tokio::test]
async fn retail_below_threshold_wholesale_at_threshold() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("TEE-1", dec!(100.00), Some((dec!(80.00), Some(10))))
        .await;
    let identity = CartIdentity::session("sess-a");

    let view = app.add(&identity, product, 3, None).await;
    assert_eq!(view.lines.len(), 1);
    assert_eq!(view.lines[0].tier, PriceTier::Retail);
    assert_eq!(view.lines[0].unit_price, dec!(100.00));
    assert_eq!(view.totals.subtotal, dec!(300.00));

    // merging to 10 crosses the threshold and reprices every unit
    let view = app.add(&identity, product, 7, None).await;
    assert_eq!(view.lines.len(), 1);
    assert_eq!(view.lines[0].qty, 10);
    assert_eq!(view.lines[0].tier, PriceTier::Wholesale);
    assert_eq!(view.lines[0].unit_price, dec!(80.00));
    assert_eq!(view.lines[0].subtotal, dec!(800.00));
    assert_eq!(view.totals.items_count, 10);
}

#[tokio::test]
async fn sellers_always_get_wholesale() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("TEE-2", dec!(50.00), Some((dec!(35.50), Some(100))))
        .await;
    let caller = seller(Uuid::new_v4());
    let identity = CartIdentity::new(Some(&caller), "sess-seller");

    let view = app.add(&identity, product, 1, Some(&caller)).await;
    assert_eq!(view.lines[0].tier, PriceTier::Wholesale);
    assert_eq!(view.lines[0].unit_price, dec!(35.50));
}

#[tokio::test]
async fn missing_wholesale_falls_back_to_retail() {
    let app = TestApp::new().await;
    let product = app.seed_product("MUG-1", dec!(12.99), None).await;
    let caller = seller(Uuid::new_v4());
    let identity = CartIdentity::new(Some(&caller), "sess-mug");

    let view = app.add(&identity, product, 3, Some(&caller)).await;
    assert_eq!(view.lines[0].tier, PriceTier::Retail);
    assert_eq!(view.lines[0].subtotal, dec!(38.97));
}

#[tokio::test]
async fn product_without_retail_price_is_rejected() {
    let app = TestApp::new().await;
    let product = app.seed_product("ODD-1", dec!(10.00), None).await;
    let orphan = Uuid::new_v4();
    let now = chrono::Utc::now();
    product::ActiveModel {
        id: Set(orphan),
        name: Set("Orphan".into()),
        sku: Set("ODD-2".into()),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*app.db)
    .await
    .unwrap();
    app.seed_price(orphan, PriceTier::Wholesale, dec!(5.00), Some(1)).await;

    let identity = CartIdentity::session("sess-orphan");
    app.add(&identity, product, 1, None).await;
    let err = app
        .state
        .services
        .carts
        .add_item(&identity, "c", orphan, 1, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::PriceNotFound(id) if id == orphan);
}

#[tokio::test]
async fn non_positive_quantity_and_unknown_product() {
    let app = TestApp::new().await;
    let identity = CartIdentity::session("sess-q");
    let carts = &app.state.services.carts;

    assert_matches!(
        carts.add_item(&identity, "c", Uuid::new_v4(), 0, None).await,
        Err(ServiceError::InvalidQuantity(0))
    );
    let missing = Uuid::new_v4();
    assert_matches!(
        carts.add_item(&identity, "c", missing, 1, None).await,
        Err(ServiceError::ProductNotFound(id)) if id == missing
    );
}

#[tokio::test]
async fn most_recently_touched_line_comes_first() {
    let app = TestApp::new().await;
    let a = app.seed_product("A-1", dec!(1.00), None).await;
    let b = app.seed_product("B-1", dec!(2.00), None).await;
    let identity = CartIdentity::session("sess-order");

    app.add(&identity, a, 1, None).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let view = app.add(&identity, b, 1, None).await;
    assert_eq!(view.lines[0].product_id, b);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let view = app.add(&identity, a, 1, None).await;
    assert_eq!(view.lines[0].product_id, a);
    assert_eq!(view.totals.subtotal, dec!(4.00));
}

#[tokio::test]
async fn update_line_reprices_unless_tier_is_kept() {
    let app = TestApp::new().await;
    let product = app
        .seed_product("TEE-3", dec!(100.00), Some((dec!(80.00), Some(10))))
        .await;
    let caller = customer(Uuid::new_v4());
    let identity = CartIdentity::new(Some(&caller), "sess-u");
    let view = app.add(&identity, product, 12, Some(&caller)).await;
    let line_id = view.lines[0].id;
    assert_eq!(view.lines[0].tier, PriceTier::Wholesale);

    let carts = &app.state.services.carts;
    let kept = carts
        .update_line_qty(&identity, line_id, 2, true, Some(&caller))
        .await
        .unwrap();
    assert_eq!(kept.lines[0].tier, PriceTier::Wholesale);
    assert_eq!(kept.lines[0].subtotal, dec!(160.00));

    let repriced = carts
        .update_line_qty(&identity, line_id, 2, false, Some(&caller))
        .await
        .unwrap();
    assert_eq!(repriced.lines[0].tier, PriceTier::Retail);
    assert_eq!(repriced.lines[0].subtotal, dec!(200.00));

    let stranger = CartIdentity::user(Uuid::new_v4());
    assert_matches!(
        carts.update_line_qty(&stranger, line_id, 1, false, None).await,
        Err(ServiceError::LineNotFound(id)) if id == line_id
    );
}

#[tokio::test]
async fn adding_to_a_locked_cart_is_refused_under_strict_policy() {
    let app = TestApp::new().await;
    let product = app.seed_product("LOCK-1", dec!(10.00), None).await;
    app.set_stock(product, 5).await;
    let identity = CartIdentity::session("sess-lock");

    app.add(&identity, product, 2, None).await;
    app.state.services.carts.lock(&identity).await.unwrap();

    assert_matches!(
        app.state
            .services
            .carts
            .add_item(&identity, "c", product, 1, None)
            .await,
        Err(ServiceError::Conflict(ConflictKind::CartLocked))
    );
    assert_eq!(app.inventory(product).await.committed, 2);
}

#[tokio::test]
async fn adding_to_a_locked_cart_unlocks_it_under_permissive_policy() {
    let app = TestApp::with_policy(StrictnessPolicy::permissive()).await;
    let product = app.seed_product("LOCK-2", dec!(10.00), None).await;
    app.set_stock(product, 5).await;
    let identity = CartIdentity::session("sess-unlock");

    app.add(&identity, product, 2, None).await;
    app.state.services.carts.lock(&identity).await.unwrap();
    assert_eq!(app.inventory(product).await.committed, 2);

    let view = app.add(&identity, product, 1, None).await;
    assert_eq!(view.status, CartStatus::Draft);
    assert_eq!(view.lines[0].qty, 3);
    assert_eq!(app.inventory(product).await.committed, 0);
    assert_eq!(app.metrics.get(metrics::RESERVATION_RELEASED), 1);
}

#[tokio::test]
async fn cart_additions_are_rate_limited_per_client() {
    let app = TestApp::with_options(common::TestOptions {
        rate_limiter: RateLimiter::in_memory(5, std::time::Duration::from_secs(900), true),
        ..Default::default()
    })
    .await;
    let product = app.seed_product("RL-1", dec!(1.00), None).await;
    let identity = CartIdentity::session("sess-rl");
    let carts = &app.state.services.carts;

    for _ in 0..5 {
        carts.add_item(&identity, "10.0.0.7", product, 1, None).await.unwrap();
    }
    assert_matches!(
        carts.add_item(&identity, "10.0.0.7", product, 1, None).await,
        Err(ServiceError::RateLimitExceeded)
    );
    assert!(carts.add_item(&identity, "10.0.0.8", product, 1, None).await.is_ok());
}
