mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{TestApp, LOCATION};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use sea_orm::sea_query::Expr;
use storefront_api::{
    auth::CartIdentity,
    entities::{reservation, Cart, CartStatus, Reservation, ReservationStatus},
    errors::{ConflictKind, ServiceError},
    metrics,
};

#[tokio::test]
async fn lock_reserves_every_line_and_commits_stock() {
    let app = TestApp::new().await;
    let a = app.seed_product("RES-A", dec!(10.00), None).await;
    let b = app.seed_product("RES-B", dec!(20.00), None).await;
    app.set_stock(a, 5).await;
    app.set_stock(b, 5).await;
    let identity = CartIdentity::session("sess-res");

    app.add(&identity, a, 2, None).await;
    app.add(&identity, b, 3, None).await;
    let (outcome, view) = app.state.services.carts.lock(&identity).await.unwrap();

    assert_eq!(view.status, CartStatus::Locked);
    assert_eq!(outcome.reservations.len(), 2);
    assert!(outcome.expires_at > Utc::now() + Duration::minutes(19));
    assert!(outcome
        .reservations
        .iter()
        .all(|r| r.status == ReservationStatus::Active && r.location_id == LOCATION));

    assert_eq!(app.inventory(a).await.committed, 2);
    assert_eq!(app.inventory(b).await.committed, 3);
    let reservations = &app.state.services.reservations;
    assert_eq!(reservations.available(a, LOCATION).await.unwrap(), 3);
    assert_eq!(reservations.available(b, LOCATION).await.unwrap(), 2);
}

#[tokio::test]
async fn shortage_reserves_nothing() {
    let app = TestApp::new().await;
    let plenty = app.seed_product("RES-OK", dec!(10.00), None).await;
    let scarce = app.seed_product("RES-LOW", dec!(10.00), None).await;
    let unstocked = app.seed_product("RES-NONE", dec!(10.00), None).await;
    app.set_stock(plenty, 10).await;
    app.set_stock(scarce, 1).await;
    let identity = CartIdentity::session("sess-short");

    app.add(&identity, plenty, 2, None).await;
    app.add(&identity, scarce, 3, None).await;
    app.add(&identity, unstocked, 1, None).await;

    let err = app.state.services.carts.lock(&identity).await.unwrap_err();
    let ServiceError::InsufficientStock(shortages) = err else {
        panic!("expected shortages, got {err:?}");
    };
    assert_eq!(shortages.len(), 2);
    let low = shortages.iter().find(|s| s.product_id == scarce).unwrap();
    assert_eq!((low.requested, low.available, low.missing), (3, 1, 2));
    let none = shortages.iter().find(|s| s.product_id == unstocked).unwrap();
    assert_eq!((none.requested, none.available, none.missing), (1, 0, 1));

    assert_eq!(app.inventory(plenty).await.committed, 0);
    assert_eq!(app.inventory(scarce).await.committed, 0);
    assert!(Reservation::find().all(&*app.db).await.unwrap().is_empty());
    let cart = app
        .state
        .services
        .carts
        .current_for(&identity)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.status, CartStatus::Draft);
}

#[tokio::test]
async fn empty_and_already_locked_carts() {
    let app = TestApp::new().await;
    let product = app.seed_product("RES-E", dec!(1.00), None).await;
    app.set_stock(product, 3).await;
    let reservations = &app.state.services.reservations;

    let empty = app
        .state
        .services
        .carts
        .get_or_create(&CartIdentity::session("sess-empty"))
        .await
        .unwrap();
    assert_matches!(reservations.reserve(empty.id).await, Err(ServiceError::CartEmpty));

    let identity = CartIdentity::session("sess-twice");
    app.add(&identity, product, 1, None).await;
    let (outcome, _) = app.state.services.carts.lock(&identity).await.unwrap();
    assert_matches!(
        reservations.reserve(outcome.cart_id).await,
        Err(ServiceError::Conflict(ConflictKind::CartLocked))
    );
    assert_eq!(app.inventory(product).await.committed, 1);
}

#[tokio::test]
async fn concurrent_locks_never_oversell() {
    let app = TestApp::new().await;
    let product = app.seed_product("RES-HOT", dec!(5.00), None).await;
    app.set_stock(product, 10).await;

    let mut identities = Vec::new();
    for i in 0..8 {
        let identity = CartIdentity::session(format!("sess-hot-{i}"));
        app.add(&identity, product, 3, None).await;
        identities.push(identity);
    }

    let carts = app.state.services.carts.clone();
    let handles: Vec<_> = identities
        .into_iter()
        .map(|identity| {
            let carts = carts.clone();
            tokio::spawn(async move { carts.lock(&identity).await })
        })
        .collect();

    let mut locked = 0;
    for result in futures::future::join_all(handles).await {
        match result.unwrap() {
            Ok(_) => locked += 1,
            Err(ServiceError::InsufficientStock(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(locked, 3);
    let row = app.inventory(product).await;
    assert_eq!(row.committed, 9);
    assert!(row.committed <= row.on_hand);
}

#[tokio::test]
async fn unlock_releases_and_is_idempotent() {
    let app = TestApp::new().await;
    let product = app.seed_product("RES-U", dec!(1.00), None).await;
    app.set_stock(product, 4).await;
    let identity = CartIdentity::session("sess-unlock");
    app.add(&identity, product, 4, None).await;
    app.state.services.carts.lock(&identity).await.unwrap();

    let view = app.state.services.carts.unlock(&identity).await.unwrap();
    assert_eq!(view.status, CartStatus::Draft);
    assert_eq!(app.inventory(product).await.committed, 0);
    let released = Reservation::find()
        .filter(reservation::Column::Status.eq(ReservationStatus::Released))
        .all(&*app.db)
        .await
        .unwrap();
    assert_eq!(released.len(), 1);

    let view = app.state.services.carts.unlock(&identity).await.unwrap();
    assert_eq!(view.status, CartStatus::Draft);
    assert_eq!(app.inventory(product).await.committed, 0);
    assert_eq!(app.metrics.get(metrics::RESERVATION_RELEASED), 1);
}

#[tokio::test]
async fn consume_moves_stock_out_and_keeps_cart_status() {
    let app = TestApp::new().await;
    let product = app.seed_product("RES-C", dec!(1.00), None).await;
    app.set_stock(product, 6).await;
    let identity = CartIdentity::session("sess-consume");
    app.add(&identity, product, 2, None).await;
    let (outcome, _) = app.state.services.carts.lock(&identity).await.unwrap();

    let consumed = app
        .state
        .services
        .reservations
        .consume(outcome.cart_id)
        .await
        .unwrap();
    assert_eq!(consumed, 1);

    let row = app.inventory(product).await;
    assert_eq!((row.on_hand, row.committed), (4, 0));
    let cart = Cart::find_by_id(outcome.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(cart.status, CartStatus::Locked);
    assert_eq!(app.metrics.get(metrics::RESERVATION_CONSUMED), 1);
}

#[tokio::test]
async fn sweep_releases_only_expired_reservations() {
    let app = TestApp::new().await;
    let product = app.seed_product("RES-X", dec!(1.00), None).await;
    app.set_stock(product, 10).await;

    let stale = CartIdentity::session("sess-stale");
    let fresh = CartIdentity::session("sess-fresh");
    app.add(&stale, product, 2, None).await;
    app.add(&fresh, product, 3, None).await;
    let (stale_lock, _) = app.state.services.carts.lock(&stale).await.unwrap();
    app.state.services.carts.lock(&fresh).await.unwrap();

    Reservation::update_many()
        .col_expr(
            reservation::Column::ExpiresAt,
            Expr::value(Utc::now() - Duration::minutes(1)),
        )
        .filter(reservation::Column::CartId.eq(stale_lock.cart_id))
        .exec(&*app.db)
        .await
        .unwrap();

    let report = app
        .state
        .services
        .reservations
        .release_expired(Utc::now())
        .await
        .unwrap();
    assert_eq!((report.carts, report.reservations), (1, 1));
    assert_eq!(app.inventory(product).await.committed, 3);

    let stale_cart = Cart::find_by_id(stale_lock.cart_id).one(&*app.db).await.unwrap().unwrap();
    assert_eq!(stale_cart.status, CartStatus::Draft);
    let fresh_cart = app.state.services.carts.current_for(&fresh).await.unwrap().unwrap();
    assert_eq!(fresh_cart.status, CartStatus::Locked);

    let again = app
        .state
        .services
        .reservations
        .release_expired(Utc::now())
        .await
        .unwrap();
    assert_eq!(again.reservations, 0);
}
