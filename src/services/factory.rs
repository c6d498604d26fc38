use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::warn;

use crate::{
    config::AppConfig,
    metrics::SharedMetrics,
    policy::StrictnessPolicy,
    rate_limiter::{InMemoryWindowCounter, RateLimiter, RedisWindowCounter, WindowCounter},
    services::{
        address_confirmation::AddressConfirmationService,
        commerce::{CartService, CheckoutService, PricingService},
        inventory_reservation_service::InventoryReservationService,
        payments::PaymentSettlementService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    policy: StrictnessPolicy,
    metrics: SharedMetrics,
    rate_limiter: RateLimiter,
}

impl ServiceFactory {
    /// Builds the rate limiter from config: Redis-backed when `redis_url` is
    /// set, process-local otherwise, enforced only when the policy says so.
    pub fn new(db: Arc<DatabaseConnection>, config: Arc<AppConfig>, metrics: SharedMetrics) -> Self {
        let policy = config.strictness_policy();
        let counter: Arc<dyn WindowCounter> = match config.redis_url.as_deref() {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => Arc::new(RedisWindowCounter::new(client)),
                Err(err) => {
                    warn!(error = %err, "Invalid redis_url, rate limiting in memory");
                    Arc::new(InMemoryWindowCounter::new())
                }
            },
            None => Arc::new(InMemoryWindowCounter::new()),
        };
        let rate_limiter = RateLimiter::new(
            counter,
            config.rate_limit_requests_per_window,
            config.rate_limit_window(),
            policy.enforce_rate_limits,
        );
        Self::with_parts(db, config, policy, metrics, rate_limiter)
    }

    /// Explicit wiring, used by tests to swap policy or limiter.
    pub fn with_parts(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        policy: StrictnessPolicy,
        metrics: SharedMetrics,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            db,
            config,
            policy,
            metrics,
            rate_limiter,
        }
    }

    pub fn policy(&self) -> StrictnessPolicy {
        self.policy
    }

    pub fn pricing_service(&self) -> PricingService {
        PricingService::new(self.db.clone())
    }

    pub fn reservation_service(&self) -> InventoryReservationService {
        InventoryReservationService::from_config(self.db.clone(), self.metrics.clone(), &self.config)
    }

    pub fn cart_service(&self) -> CartService {
        CartService::new(
            self.db.clone(),
            self.reservation_service(),
            self.rate_limiter.clone(),
            self.policy,
            self.metrics.clone(),
            self.config.default_currency.clone(),
        )
    }

    pub fn checkout_service(&self) -> CheckoutService {
        CheckoutService::new(self.db.clone(), self.cart_service(), self.policy, self.metrics.clone())
    }

    pub fn address_service(&self) -> AddressConfirmationService {
        AddressConfirmationService::new(self.db.clone(), self.policy, self.metrics.clone())
    }

    pub fn payment_service(&self) -> PaymentSettlementService {
        PaymentSettlementService::new(
            self.db.clone(),
            self.reservation_service(),
            self.policy,
            self.metrics.clone(),
        )
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub pricing: Arc<PricingService>,
    pub reservations: Arc<InventoryReservationService>,
    pub carts: Arc<CartService>,
    pub checkout: Arc<CheckoutService>,
    pub addresses: Arc<AddressConfirmationService>,
    pub payments: Arc<PaymentSettlementService>,
}

impl ServiceContainer {
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            pricing: Arc::new(factory.pricing_service()),
            reservations: Arc::new(factory.reservation_service()),
            carts: Arc::new(factory.cart_service()),
            checkout: Arc::new(factory.checkout_service()),
            addresses: Arc::new(factory.address_service()),
            payments: Arc::new(factory.payment_service()),
        }
    }
}
