/// Commerce services: pricing, carts and checkout
pub mod cart_service;
pub mod checkout_service;
pub mod pricing_service;

pub use cart_service::{CartLineView, CartService, CartTotals, CartView};
pub use checkout_service::{CheckoutService, CheckoutSummary, StartCheckout};
pub use pricing_service::{PricingService, ResolvedPrice};
