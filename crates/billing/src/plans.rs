//! Plan changes on live subscriptions
//!
//! Tier changes swap the price on the subscription's single item with
//! proration; cancellations flag the subscription to end at period close.
//! Both paths write an optimistic local update so the dashboard reflects the
//! change immediately, and leave `processor_synced_at` untouched so the
//! confirming webhook still applies.

use sqlx::PgPool;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
use uuid::Uuid;
use venuepass_shared::{Membership, MembershipTier, Venue};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::memberships::MembershipLedger;
use crate::provisioner::PriceProvisioner;

/// Service for mutating existing subscriptions
pub struct PlanService {
    stripe: StripeClient,
    pool: PgPool,
}

impl PlanService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Move a member's subscription to a different tier at the same venue
    pub async fn change_tier(
        &self,
        member_id: Uuid,
        venue_id: Uuid,
        new_tier_id: Uuid,
    ) -> BillingResult<()> {
        let ledger = MembershipLedger::new(self.pool.clone());
        let membership = ledger
            .get(venue_id, member_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!(
                "No membership for member {} at venue {}",
                member_id, venue_id
            )))?;

        let new_tier: MembershipTier = sqlx::query_as(
            "SELECT id, venue_id, name, price_cents, currency, stripe_price_id, created_at, updated_at \
             FROM membership_tiers WHERE id = $1 AND venue_id = $2",
        )
        .bind(new_tier_id)
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("Membership tier not found: {}", new_tier_id))
        })?;

        let venue: Venue = sqlx::query_as(
            "SELECT id, name, slug, trial_days, created_at, updated_at FROM venues WHERE id = $1",
        )
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("Venue not found: {}", venue_id)))?;

        let provisioner = PriceProvisioner::new(self.stripe.clone(), self.pool.clone());
        let price_id = provisioner.ensure_price(&venue, &new_tier).await?;

        let subscription_id = parse_subscription_id(&membership)?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;

        // Single-item subscriptions: swap the price on the existing item
        // rather than adding a second one
        let item_id = subscription
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Subscription {} has no items",
                    subscription_id
                ))
            })?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("member_id".to_string(), member_id.to_string());
        metadata.insert("venue_id".to_string(), venue_id.to_string());
        metadata.insert("tier_id".to_string(), new_tier_id.to_string());

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.clone()),
                ..Default::default()
            }]),
            metadata: Some(metadata),
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        Subscription::update(self.stripe.inner(), &subscription_id, params).await?;

        // Optimistic: the confirming webhook re-applies this with the
        // processor's own timestamp
        ledger.set_tier_optimistic(membership.id, new_tier_id).await?;

        let logger = BillingEventLogger::new(self.pool.clone());
        logger
            .log_event(
                BillingEventBuilder::new(venue_id, BillingEventType::TierChanged)
                    .member(member_id)
                    .stripe_subscription(subscription_id.as_str())
                    .data(serde_json::json!({
                        "from_tier_id": membership.tier_id,
                        "to_tier_id": new_tier_id,
                        "price_id": price_id,
                    }))
                    .actor_type(ActorType::Member),
            )
            .await?;

        tracing::info!(
            member_id = %member_id,
            venue_id = %venue_id,
            new_tier_id = %new_tier_id,
            subscription_id = %subscription_id,
            "Changed membership tier"
        );

        Ok(())
    }

    /// Cancel a member's subscription at period end
    pub async fn cancel(&self, member_id: Uuid, venue_id: Uuid) -> BillingResult<()> {
        let ledger = MembershipLedger::new(self.pool.clone());
        let membership = ledger
            .get(venue_id, member_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!(
                "No membership for member {} at venue {}",
                member_id, venue_id
            )))?;

        let subscription_id = parse_subscription_id(&membership)?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        Subscription::update(self.stripe.inner(), &subscription_id, params).await?;

        ledger.set_cancelled_optimistic(membership.id).await?;
        ledger.refresh_profile_access(member_id).await?;

        let logger = BillingEventLogger::new(self.pool.clone());
        logger
            .log_event(
                BillingEventBuilder::new(venue_id, BillingEventType::MembershipCancelled)
                    .member(member_id)
                    .stripe_subscription(subscription_id.as_str())
                    .actor_type(ActorType::Member),
            )
            .await?;

        tracing::info!(
            member_id = %member_id,
            venue_id = %venue_id,
            subscription_id = %subscription_id,
            "Cancelled membership at period end"
        );

        Ok(())
    }
}

fn parse_subscription_id(membership: &Membership) -> BillingResult<SubscriptionId> {
    let raw = membership.stripe_subscription_id.as_deref().ok_or_else(|| {
        BillingError::InvalidInput(format!(
            "Membership {} has no subscription on file",
            membership.id
        ))
    })?;

    raw.parse::<SubscriptionId>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
}
