#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set};
use serde_json::Value;
use storefront_api::{
    auth::{Caller, CartIdentity, Role, SESSION_COOKIE, USER_ID_HEADER, USER_ROLE_HEADER},
    config::AppConfig,
    db,
    entities::{
        address, order, product, product_price, AddressKind, InventoryRecord, InventoryRecordModel,
        Order, OrderModel, PriceTier,
    },
    metrics::InMemoryMetrics,
    policy::StrictnessPolicy,
    rate_limiter::RateLimiter,
    services::{
        commerce::{CartView, CheckoutSummary, StartCheckout},
        ServiceFactory,
    },
    webhooks::{SignatureGenerator, REQUEST_ID_HEADER, SIGNATURE_HEADER},
    AppState,
};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const LOCATION: i32 = 1;

/// Application state over a throwaway SQLite file.
///
/// The pool holds a single connection, so concurrent transactions queue up
/// behind one another the way row locks serialize them on Postgres.
pub struct TestApp {
    router: Router,
    pub state: Arc<AppState>,
    pub db: Arc<DatabaseConnection>,
    pub metrics: Arc<InMemoryMetrics>,
    _dir: TempDir,
}

pub struct TestOptions {
    pub policy: StrictnessPolicy,
    pub rate_limiter: RateLimiter,
    pub webhook_secret: Option<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            policy: StrictnessPolicy::strict(),
            rate_limiter: RateLimiter::disabled(),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        }
    }
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    pub async fn with_policy(policy: StrictnessPolicy) -> Self {
        Self::with_options(TestOptions {
            policy,
            ..TestOptions::default()
        })
        .await
    }

    pub async fn with_options(options: TestOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_file = dir.path().join("storefront_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_file.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        cfg.payment_webhook_secret = options.webhook_secret;
        cfg.default_location_id = LOCATION;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = Arc::new(cfg);
        let factory = ServiceFactory::with_parts(
            db.clone(),
            config.clone(),
            options.policy,
            metrics.clone(),
            options.rate_limiter,
        );
        let state = Arc::new(AppState::from_factory(
            db.clone(),
            config,
            metrics.clone(),
            &factory,
        ));
        let router = storefront_api::app(state.clone());

        Self {
            router,
            state,
            db,
            metrics,
            _dir: dir,
        }
    }

    /// Active product with a retail price and an optional wholesale tier.
    pub async fn seed_product(
        &self,
        sku: &str,
        retail: Decimal,
        wholesale: Option<(Decimal, Option<i32>)>,
    ) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(format!("Product {sku}")),
            sku: Set(sku.to_string()),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert product");

        self.seed_price(id, PriceTier::Retail, retail, None).await;
        if let Some((amount, min_qty)) = wholesale {
            self.seed_price(id, PriceTier::Wholesale, amount, min_qty).await;
        }
        id
    }

    pub async fn seed_price(&self, product_id: Uuid, tier: PriceTier, amount: Decimal, min_qty: Option<i32>) {
        product_price::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            tier: Set(tier),
            currency: Set("ARS".to_string()),
            amount: Set(amount),
            min_qty: Set(min_qty),
        }
        .insert(&*self.db)
        .await
        .expect("insert price");
    }

    pub async fn set_stock(&self, product_id: Uuid, on_hand: i32) {
        storefront_api::entities::inventory_record::ActiveModel {
            product_id: Set(product_id),
            location_id: Set(LOCATION),
            on_hand: Set(on_hand),
            committed: Set(0),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert inventory");
    }

    pub async fn inventory(&self, product_id: Uuid) -> InventoryRecordModel {
        InventoryRecord::find_by_id((product_id, LOCATION))
            .one(&*self.db)
            .await
            .expect("load inventory")
            .expect("inventory row")
    }

    pub async fn seed_address(&self, user_id: Uuid, kind: AddressKind, is_default: bool) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        address::ActiveModel {
            id: Set(id),
            user_id: Set(user_id),
            kind: Set(kind),
            name: Set("Ada Lovelace".to_string()),
            street: Set("Av. Corrientes 1234".to_string()),
            city: Set("Buenos Aires".to_string()),
            province: Set("CABA".to_string()),
            zip_code: Set("C1043".to_string()),
            country: Set("AR".to_string()),
            phone: Set(None),
            is_default: Set(is_default),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert address");
        id
    }

    pub async fn order(&self, order_id: Uuid) -> OrderModel {
        Order::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("load order")
            .expect("order row")
    }

    /// Adds `qty` of a product to the identity's cart.
    pub async fn add(&self, identity: &CartIdentity, product_id: Uuid, qty: i32, caller: Option<&Caller>) -> CartView {
        self.state
            .services
            .carts
            .add_item(identity, "test-client", product_id, qty, caller)
            .await
            .expect("add item")
    }

    /// Customer with one cart line locked and a started checkout.
    pub async fn started_order(&self, user_id: Uuid, product_id: Uuid, qty: i32) -> CheckoutSummary {
        let caller = customer(user_id);
        let identity = CartIdentity::new(Some(&caller), "sess-started");
        self.add(&identity, product_id, qty, Some(&caller)).await;
        self.state.services.carts.lock(&identity).await.expect("lock cart");
        self.state
            .services
            .checkout
            .start(StartCheckout::default(), Some(&caller), "sess-started")
            .await
            .expect("start checkout")
    }

    /// Order with both addresses selected and confirmed, ready for payment.
    pub async fn confirmed_order(&self, user_id: Uuid, product_id: Uuid, qty: i32) -> CheckoutSummary {
        let summary = self.started_order(user_id, product_id, qty).await;
        let caller = customer(user_id);
        let shipping = self.seed_address(user_id, AddressKind::Shipping, true).await;
        let billing = self.seed_address(user_id, AddressKind::Billing, true).await;
        let addresses = &self.state.services.addresses;
        addresses
            .select(&summary.order_number, Some(shipping), Some(billing), &caller)
            .await
            .expect("select addresses");
        addresses
            .confirm(&summary.order_number, &caller)
            .await
            .expect("confirm addresses");
        summary
    }

    pub async fn request(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(req)
            .await
            .expect("router response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }

    /// JSON request as `user` (or a guest) on `session`.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        user: Option<Uuid>,
        session: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("cookie", format!("{SESSION_COOKIE}={session}"));
        if let Some(user_id) = user {
            builder = builder
                .header(USER_ID_HEADER, user_id.to_string())
                .header(USER_ROLE_HEADER, Role::Customer.to_string());
        }
        let req = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        self.request(req).await
    }

    /// Posts a notification signed for `now`.
    pub async fn post_webhook(&self, payload: &Value) -> (StatusCode, Value) {
        let payment_id = payload["data"]["id"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| payload["data"]["id"].to_string());
        let ts = Utc::now().timestamp();
        let signature = SignatureGenerator::new(WEBHOOK_SECRET).header_value(&payment_id, "req-wh-1", ts);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(REQUEST_ID_HEADER, "req-wh-1")
            .body(Body::from(payload.to_string()))
            .expect("request");
        self.request(req).await
    }
}

pub fn customer(user_id: Uuid) -> Caller {
    Caller::customer(user_id)
}

pub fn seller(user_id: Uuid) -> Caller {
    Caller {
        user_id,
        role: Role::Seller,
    }
}

/// Order status as stored, for assertions that care about the raw row.
pub fn statuses(order: &order::Model) -> (String, String) {
    (order.status.to_string(), order.payment_status.to_string())
}
