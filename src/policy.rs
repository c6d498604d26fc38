//! Deployment strictness.
//!
//! Every relaxation the engine knows about is a named flag here. Services
//! receive the policy value explicitly; nothing inspects the environment name.

/// Flags toggled between the `strict` and `permissive` profiles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StrictnessPolicy {
    /// Adding to a locked cart releases its reservations and reverts it to draft.
    pub unlock_on_add: bool,
    /// Checkout and address confirmation need an active, unexpired reservation.
    pub require_active_reservations: bool,
    /// A terminal order may be detached from its cart so the cart can re-checkout.
    pub detach_terminal_orders: bool,
    /// A notification without a status is treated as approved.
    pub default_missing_status_to_approved: bool,
    /// Unresolvable notifications settle the latest pending order.
    pub fallback_to_latest_pending_order: bool,
    pub enforce_rate_limits: bool,
    /// A guest cart may only be checked out by the session that owns it.
    pub enforce_cart_session_match: bool,
}

impl StrictnessPolicy {
    pub const fn strict() -> Self {
        Self {
            unlock_on_add: false,
            require_active_reservations: true,
            detach_terminal_orders: false,
            default_missing_status_to_approved: false,
            fallback_to_latest_pending_order: false,
            enforce_rate_limits: true,
            enforce_cart_session_match: true,
        }
    }

    pub const fn permissive() -> Self {
        Self {
            unlock_on_add: true,
            require_active_reservations: false,
            detach_terminal_orders: true,
            default_missing_status_to_approved: true,
            fallback_to_latest_pending_order: true,
            enforce_rate_limits: false,
            enforce_cart_session_match: false,
        }
    }
}

impl Default for StrictnessPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_strict() {
        assert_eq!(StrictnessPolicy::default(), StrictnessPolicy::strict());
    }

    #[test]
    fn profiles_differ_on_every_flag() {
        let s = StrictnessPolicy::strict();
        let p = StrictnessPolicy::permissive();
        assert_ne!(s.unlock_on_add, p.unlock_on_add);
        assert_ne!(s.require_active_reservations, p.require_active_reservations);
        assert_ne!(s.detach_terminal_orders, p.detach_terminal_orders);
        assert_ne!(
            s.default_missing_status_to_approved,
            p.default_missing_status_to_approved
        );
        assert_ne!(
            s.fallback_to_latest_pending_order,
            p.fallback_to_latest_pending_order
        );
        assert_ne!(s.enforce_rate_limits, p.enforce_rate_limits);
        assert_ne!(s.enforce_cart_session_match, p.enforce_cart_session_match);
    }
}
