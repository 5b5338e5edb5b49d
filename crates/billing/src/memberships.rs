//! Membership ledger access
//!
//! All writes to the `memberships` table go through here. Webhook-driven
//! writes carry the processor event timestamp and are guarded so a stale
//! redelivery can never clobber newer state: a write applies only when
//! `processor_synced_at` is NULL or at most the incoming timestamp.
//! Optimistic writes from the synchronous API paths touch single columns and
//! leave `processor_synced_at` alone.

use sqlx::PgPool;
use stripe::SubscriptionStatus as StripeSubStatus;
use time::OffsetDateTime;
use uuid::Uuid;
use venuepass_shared::{Membership, MembershipStatus, Payment};

use crate::error::BillingResult;

const MEMBERSHIP_COLUMNS: &str = "id, venue_id, member_id, tier_id, stripe_subscription_id, \
     status, trial_ends_at, current_period_end, cancel_at_period_end, processor_synced_at, \
     created_at, updated_at";

/// Processor-reported state destined for the ledger
#[derive(Debug, Clone)]
pub struct SyncedMembership {
    pub venue_id: Uuid,
    pub member_id: Uuid,
    pub tier_id: Uuid,
    pub stripe_subscription_id: String,
    pub status: MembershipStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// `created` timestamp of the event this state came from
    pub event_timestamp: OffsetDateTime,
}

/// Ledger reads and writes for memberships
#[derive(Clone)]
pub struct MembershipLedger {
    pool: PgPool,
}

impl MembershipLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a member's membership at a venue
    pub async fn get(&self, venue_id: Uuid, member_id: Uuid) -> BillingResult<Option<Membership>> {
        let membership = sqlx::query_as(&format!(
            "SELECT {} FROM memberships WHERE venue_id = $1 AND member_id = $2",
            MEMBERSHIP_COLUMNS
        ))
        .bind(venue_id)
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(membership)
    }

    /// Look up a membership by its Stripe subscription id
    pub async fn get_by_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Membership>> {
        let membership = sqlx::query_as(&format!(
            "SELECT {} FROM memberships WHERE stripe_subscription_id = $1",
            MEMBERSHIP_COLUMNS
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(membership)
    }

    /// Upsert processor-reported state onto the (venue, member) row.
    /// Resubscription after cancellation reuses the existing row. Returns the
    /// number of rows written (0 when the revision guard rejected the write).
    pub async fn upsert_synced(&self, synced: &SyncedMembership) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO memberships
                (id, venue_id, member_id, tier_id, stripe_subscription_id, status,
                 trial_ends_at, current_period_end, cancel_at_period_end,
                 processor_synced_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
            ON CONFLICT (venue_id, member_id)
            DO UPDATE SET
                tier_id = EXCLUDED.tier_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                status = EXCLUDED.status,
                trial_ends_at = EXCLUDED.trial_ends_at,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                processor_synced_at = EXCLUDED.processor_synced_at,
                updated_at = NOW()
            WHERE memberships.processor_synced_at IS NULL
               OR memberships.processor_synced_at <= EXCLUDED.processor_synced_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(synced.venue_id)
        .bind(synced.member_id)
        .bind(synced.tier_id)
        .bind(&synced.stripe_subscription_id)
        .bind(synced.status)
        .bind(synced.trial_ends_at)
        .bind(synced.current_period_end)
        .bind(synced.cancel_at_period_end)
        .bind(synced.event_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mirror a subscription update onto the row keyed by subscription id.
    /// `tier_id` is only touched when the processor metadata carried one.
    pub async fn apply_subscription_update(
        &self,
        stripe_subscription_id: &str,
        status: MembershipStatus,
        tier_id: Option<Uuid>,
        trial_ends_at: Option<OffsetDateTime>,
        current_period_end: Option<OffsetDateTime>,
        cancel_at_period_end: bool,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE memberships
            SET status = $2,
                tier_id = COALESCE($3, tier_id),
                trial_ends_at = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                processor_synced_at = $7,
                updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND (processor_synced_at IS NULL OR processor_synced_at <= $7)
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status)
        .bind(tier_id)
        .bind(trial_ends_at)
        .bind(current_period_end)
        .bind(cancel_at_period_end)
        .bind(event_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Terminal status write for subscription.deleted events
    pub async fn mark_cancelled(
        &self,
        stripe_subscription_id: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.set_status_synced(stripe_subscription_id, MembershipStatus::Cancelled, event_timestamp)
            .await
    }

    /// Status write for invoice.payment_failed events
    pub async fn mark_past_due(
        &self,
        stripe_subscription_id: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.set_status_synced(stripe_subscription_id, MembershipStatus::PastDue, event_timestamp)
            .await
    }

    async fn set_status_synced(
        &self,
        stripe_subscription_id: &str,
        status: MembershipStatus,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE memberships
            SET status = $2, processor_synced_at = $3, updated_at = NOW()
            WHERE stripe_subscription_id = $1
              AND (processor_synced_at IS NULL OR processor_synced_at <= $3)
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(status)
        .bind(event_timestamp)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Optimistic tier write after a plan change was accepted by Stripe.
    /// Does not advance `processor_synced_at`; the webhook confirms later.
    pub async fn set_tier_optimistic(&self, membership_id: Uuid, tier_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE memberships SET tier_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(tier_id)
            .bind(membership_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Optimistic status write after a cancellation was accepted by Stripe
    pub async fn set_cancelled_optimistic(&self, membership_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE memberships \
             SET status = 'cancelled', cancel_at_period_end = TRUE, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(membership_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recompute the profile's access flag from its memberships. Derived from
    /// the ledger rather than toggled per event, so a member with memberships
    /// at several venues keeps access while any one of them is live.
    pub async fn refresh_profile_access(&self, member_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE profiles
            SET membership_active = EXISTS (
                    SELECT 1 FROM memberships
                    WHERE member_id = $1 AND status IN ('trialing', 'active')
                ),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Payment history for a member at a venue, newest first
    pub async fn payments_for_member(
        &self,
        venue_id: Uuid,
        member_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as(
            "SELECT id, venue_id, member_id, amount_cents, currency, status, \
                    stripe_event_id, stripe_session_id, created_at \
             FROM payments WHERE venue_id = $1 AND member_id = $2 \
             ORDER BY created_at DESC LIMIT $3",
        )
        .bind(venue_id)
        .bind(member_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }
}

/// Revision-guard decision: apply an event only when the row has never been
/// synced or the incoming event is not older than the last applied one.
/// Equal timestamps re-apply so idempotent redelivery converges.
pub fn should_apply_event(
    stored: Option<OffsetDateTime>,
    incoming: OffsetDateTime,
) -> bool {
    match stored {
        None => true,
        Some(stored) => stored <= incoming,
    }
}

/// Map a processor-reported subscription status onto the local ledger status.
/// Returns None for statuses that must not change local state. A subscription
/// flagged to cancel at period end reads as cancelled locally regardless of
/// its processor status.
pub fn map_processor_status(
    status: StripeSubStatus,
    cancel_at_period_end: bool,
) -> Option<MembershipStatus> {
    if cancel_at_period_end {
        return Some(MembershipStatus::Cancelled);
    }

    match status {
        StripeSubStatus::Trialing => Some(MembershipStatus::Trialing),
        StripeSubStatus::Active => Some(MembershipStatus::Active),
        StripeSubStatus::PastDue => Some(MembershipStatus::PastDue),
        StripeSubStatus::Canceled | StripeSubStatus::Unpaid | StripeSubStatus::IncompleteExpired => {
            Some(MembershipStatus::Cancelled)
        }
        // Never grant or change access on half-open processor states
        StripeSubStatus::Incomplete | StripeSubStatus::Paused => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_unsynced_row_accepts_any_event() {
        let now = OffsetDateTime::now_utc();
        assert!(should_apply_event(None, now));
        assert!(should_apply_event(None, now - Duration::days(30)));
    }

    #[test]
    fn test_stale_event_is_rejected() {
        let now = OffsetDateTime::now_utc();
        assert!(!should_apply_event(Some(now), now - Duration::seconds(1)));
    }

    #[test]
    fn test_equal_timestamp_reapplies() {
        let now = OffsetDateTime::now_utc();
        assert!(should_apply_event(Some(now), now));
    }

    #[test]
    fn test_newer_event_is_applied() {
        let now = OffsetDateTime::now_utc();
        assert!(should_apply_event(Some(now), now + Duration::seconds(1)));
    }

    #[test]
    fn test_status_mapping_mirrors_active_states() {
        assert_eq!(
            map_processor_status(StripeSubStatus::Trialing, false),
            Some(MembershipStatus::Trialing)
        );
        assert_eq!(
            map_processor_status(StripeSubStatus::Active, false),
            Some(MembershipStatus::Active)
        );
        assert_eq!(
            map_processor_status(StripeSubStatus::PastDue, false),
            Some(MembershipStatus::PastDue)
        );
    }

    #[test]
    fn test_status_mapping_terminal_states_cancel() {
        for status in [
            StripeSubStatus::Canceled,
            StripeSubStatus::Unpaid,
            StripeSubStatus::IncompleteExpired,
        ] {
            assert_eq!(
                map_processor_status(status, false),
                Some(MembershipStatus::Cancelled)
            );
        }
    }

    #[test]
    fn test_status_mapping_skips_half_open_states() {
        assert_eq!(map_processor_status(StripeSubStatus::Incomplete, false), None);
        assert_eq!(map_processor_status(StripeSubStatus::Paused, false), None);
    }

    #[test]
    fn test_cancel_at_period_end_wins_over_status() {
        assert_eq!(
            map_processor_status(StripeSubStatus::Active, true),
            Some(MembershipStatus::Cancelled)
        );
        assert_eq!(
            map_processor_status(StripeSubStatus::Trialing, true),
            Some(MembershipStatus::Cancelled)
        );
    }
}
