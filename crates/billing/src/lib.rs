//! VenuePass billing integration
//!
//! Owns the Stripe integration and every write to the membership ledger:
//! lazy catalog provisioning, checkout orchestration, plan changes, and
//! webhook-driven reconciliation.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod checkout;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod memberships;
pub mod plans;
pub mod provisioner;
pub mod webhooks;

pub use checkout::CheckoutService;
pub use client::{StripeClient, StripeConfig};
pub use customer::CustomerService;
pub use email::{BillingEmailService, EmailConfig};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use memberships::{
    map_processor_status, should_apply_event, MembershipLedger, SyncedMembership,
};
pub use plans::PlanService;
pub use provisioner::PriceProvisioner;
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Aggregated billing service with all sub-services wired to the same Stripe
/// client and connection pool
pub struct BillingService {
    pub customers: CustomerService,
    pub provisioner: PriceProvisioner,
    pub checkout: CheckoutService,
    pub plans: PlanService,
    pub memberships: MembershipLedger,
    pub events: BillingEventLogger,
    pub email: BillingEmailService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create all billing services from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let email_config = EmailConfig::from_env();
        Ok(Self::new(config, email_config, pool))
    }

    /// Create all billing services from explicit configuration
    pub fn new(config: StripeConfig, email_config: EmailConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config);
        let email = BillingEmailService::new(email_config);

        Self {
            customers: CustomerService::new(stripe.clone(), pool.clone()),
            provisioner: PriceProvisioner::new(stripe.clone(), pool.clone()),
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            plans: PlanService::new(stripe.clone(), pool.clone()),
            memberships: MembershipLedger::new(pool.clone()),
            events: BillingEventLogger::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool, email.clone()),
            email,
        }
    }
}
