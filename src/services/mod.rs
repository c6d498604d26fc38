// Stock ledger and reservations
pub mod inventory_reservation_service;

// Carts, pricing and checkout
pub mod commerce;

// Order lifecycle after checkout
pub mod address_confirmation;
pub mod order_sequence;
pub mod payments;

// Service factory for dependency injection
pub mod factory;

pub use factory::{ServiceContainer, ServiceFactory};
