//! Stripe Checkout sessions
//!
//! Subscribing a member to a venue is a single orchestration: load the tier,
//! venue, and profile, make sure the Stripe customer and price exist, then
//! hand the member a hosted checkout URL. No membership row is written here;
//! the ledger only changes when the checkout webhook lands.

use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData,
};
use uuid::Uuid;
use venuepass_shared::{MembershipTier, Profile, Venue};

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::provisioner::PriceProvisioner;

/// Checkout service for starting venue subscriptions
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Start a subscription for a member at a venue. Returns the hosted
    /// checkout URL the member should be redirected to.
    pub async fn start_subscription(
        &self,
        member_id: Uuid,
        venue_id: Uuid,
        tier_id: Uuid,
    ) -> BillingResult<String> {
        let tier: MembershipTier = sqlx::query_as(
            "SELECT id, venue_id, name, price_cents, currency, stripe_price_id, created_at, updated_at \
             FROM membership_tiers WHERE id = $1 AND venue_id = $2",
        )
        .bind(tier_id)
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Membership tier not found: {}", tier_id)))?;

        let venue: Venue = sqlx::query_as(
            "SELECT id, name, slug, trial_days, created_at, updated_at FROM venues WHERE id = $1",
        )
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Venue not found: {}", venue_id)))?;

        let profile: Profile = sqlx::query_as(
            "SELECT id, email, full_name, role, membership_active, stripe_customer_id, created_at, updated_at \
             FROM profiles WHERE id = $1",
        )
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Profile not found: {}", member_id)))?;

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        let customer_id = customers
            .get_or_create_customer(member_id, venue_id, &profile.email, profile.full_name.as_deref())
            .await?;

        let provisioner = PriceProvisioner::new(self.stripe.clone(), self.pool.clone());
        let price_id = provisioner.ensure_price(&venue, &tier).await?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = success_url(base_url);
        let cancel_url = cancel_url(base_url, &venue.slug);

        // The same routing metadata goes on both the session and the
        // subscription it creates, so every later webhook can find its way
        // back to the ledger row
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("member_id".to_string(), member_id.to_string());
        metadata.insert("venue_id".to_string(), venue_id.to_string());
        metadata.insert("tier_id".to_string(), tier_id.to_string());

        let subscription_data = CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            trial_period_days: trial_period_days(venue.trial_days),
            ..Default::default()
        };

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            subscription_data: Some(subscription_data),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            member_id = %member_id,
            venue_id = %venue_id,
            tier_id = %tier_id,
            session_id = %session.id,
            trial_days = venue.trial_days,
            "Created checkout session"
        );

        session.url.ok_or_else(|| {
            BillingError::Internal("Checkout session created without a URL".to_string())
        })
    }
}

fn success_url(base_url: &str) -> String {
    format!("{}/dashboard/venues?joined=true", base_url)
}

fn cancel_url(base_url: &str, venue_slug: &str) -> String {
    format!("{}/dashboard/venues/{}", base_url, venue_slug)
}

/// Stripe rejects `trial_period_days: 0`; venues with no trial omit the field
fn trial_period_days(trial_days: i32) -> Option<u32> {
    if trial_days > 0 {
        Some(trial_days as u32)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_urls_are_venue_scoped() {
        assert_eq!(
            success_url("https://venuepass.app"),
            "https://venuepass.app/dashboard/venues?joined=true"
        );
        assert_eq!(
            cancel_url("https://venuepass.app", "ironworks"),
            "https://venuepass.app/dashboard/venues/ironworks"
        );
    }

    #[test]
    fn test_trial_period_days_omitted_when_zero() {
        assert_eq!(trial_period_days(0), None);
        assert_eq!(trial_period_days(-1), None);
        assert_eq!(trial_period_days(7), Some(7));
        assert_eq!(trial_period_days(30), Some(30));
    }
}
