//! Integration tests for the membership ledger lifecycle
//!
//! These tests verify that webhook-driven writes respect the revision guard
//! and that local state converges regardless of delivery order.
//!
//! ## Test Coverage
//! - Ledger upserts for first-time and resubscribing members
//! - Out-of-order webhook delivery (stale events rejected)
//! - Terminal status writes (cancelled, past due)
//! - Optimistic API writes vs webhook confirmation
//! - Profile access flag derivation
//! - Payment history reads
//! - Billing audit trail persistence
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://..."
//! cargo test --test membership_lifecycle -- --ignored --test-threads=1
//! ```

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use venuepass_billing::{
    ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType, MembershipLedger,
    SyncedMembership,
};
use venuepass_shared::{MembershipStatus, PaymentStatus};

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup_pool() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

/// Create a venue, a member profile, and a tier; returns (venue_id, member_id, tier_id)
async fn create_test_fixtures(pool: &PgPool) -> (Uuid, Uuid, Uuid) {
    let venue_id = Uuid::new_v4();
    let member_id = Uuid::new_v4();
    let tier_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO venues (id, name, slug, trial_days, created_at, updated_at)
        VALUES ($1, 'Test Venue', $2, 7, NOW(), NOW())
        "#,
    )
    .bind(venue_id)
    .bind(format!("test-venue-{}", venue_id))
    .execute(pool)
    .await
    .expect("Failed to create test venue");

    sqlx::query(
        r#"
        INSERT INTO profiles (id, email, full_name, role, membership_active, created_at, updated_at)
        VALUES ($1, $2, 'Test Member', 'member', FALSE, NOW(), NOW())
        "#,
    )
    .bind(member_id)
    .bind(format!("test-member-{}@example.com", member_id))
    .execute(pool)
    .await
    .expect("Failed to create test profile");

    sqlx::query(
        r#"
        INSERT INTO membership_tiers (id, venue_id, name, price_cents, currency, created_at, updated_at)
        VALUES ($1, $2, 'Standard', 4900, 'aud', NOW(), NOW())
        "#,
    )
    .bind(tier_id)
    .bind(venue_id)
    .execute(pool)
    .await
    .expect("Failed to create test tier");

    (venue_id, member_id, tier_id)
}

/// Cleanup test data after test completion
async fn cleanup_test_data(pool: &PgPool, venue_id: Uuid, member_id: Uuid) {
    // Delete in order to respect foreign key constraints
    sqlx::query("DELETE FROM billing_events WHERE venue_id = $1")
        .bind(venue_id)
        .execute(pool)
        .await
        .ok(); // Ignore errors during cleanup

    sqlx::query("DELETE FROM payments WHERE venue_id = $1")
        .bind(venue_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM memberships WHERE venue_id = $1")
        .bind(venue_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM membership_tiers WHERE venue_id = $1")
        .bind(venue_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM profiles WHERE id = $1")
        .bind(member_id)
        .execute(pool)
        .await
        .ok();

    sqlx::query("DELETE FROM venues WHERE id = $1")
        .bind(venue_id)
        .execute(pool)
        .await
        .ok();
}

fn synced(
    venue_id: Uuid,
    member_id: Uuid,
    tier_id: Uuid,
    subscription_id: &str,
    status: MembershipStatus,
    event_timestamp: OffsetDateTime,
) -> SyncedMembership {
    SyncedMembership {
        venue_id,
        member_id,
        tier_id,
        stripe_subscription_id: subscription_id.to_string(),
        status,
        trial_ends_at: None,
        current_period_end: Some(event_timestamp + Duration::days(30)),
        cancel_at_period_end: false,
        event_timestamp,
    }
}

// ============================================================================
// Test Cases: Ledger Writes
// ============================================================================

#[tokio::test]
#[ignore] // Requires DATABASE_URL
async fn test_upsert_creates_membership() {
    // Given: a venue, member, and tier with no membership row
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    // When: a checkout-completed sync lands
    let now = OffsetDateTime::now_utc();
    let rows = ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            now,
        ))
        .await
        .expect("Failed to upsert membership");

    // Then: the row exists with the synced state
    assert_eq!(rows, 1, "Upsert should write one row");

    let membership = ledger
        .get(venue_id, member_id)
        .await
        .expect("Failed to fetch membership")
        .expect("Membership should exist");

    assert_eq!(membership.status, MembershipStatus::Active);
    assert_eq!(membership.tier_id, tier_id);
    assert_eq!(membership.stripe_subscription_id.as_deref(), Some(sub_id.as_str()));
    assert!(membership.processor_synced_at.is_some());

    cleanup_test_data(&pool, venue_id, member_id).await;
}

#[tokio::test]
#[ignore]
async fn test_resubscription_reuses_row() {
    // Given: a cancelled membership
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let old_sub = format!("sub_old_{}", Uuid::new_v4().simple());
    let new_sub = format!("sub_new_{}", Uuid::new_v4().simple());

    let t0 = OffsetDateTime::now_utc() - Duration::days(60);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &old_sub,
            MembershipStatus::Cancelled,
            t0,
        ))
        .await
        .expect("Failed to seed cancelled membership");

    let original_id = ledger
        .get(venue_id, member_id)
        .await
        .unwrap()
        .unwrap()
        .id;

    // When: the member subscribes again with a fresh subscription
    let t1 = OffsetDateTime::now_utc();
    let rows = ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &new_sub,
            MembershipStatus::Active,
            t1,
        ))
        .await
        .expect("Failed to resubscribe");

    // Then: the same row now carries the new subscription
    assert_eq!(rows, 1);
    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(membership.id, original_id, "Resubscription should reuse the row");
    assert_eq!(membership.status, MembershipStatus::Active);
    assert_eq!(membership.stripe_subscription_id.as_deref(), Some(new_sub.as_str()));

    cleanup_test_data(&pool, venue_id, member_id).await;
}

// ============================================================================
// Test Cases: Out-of-Order Delivery
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_stale_webhook_is_rejected() {
    // Given: a membership synced at time T
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let newer = OffsetDateTime::now_utc();
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            newer,
        ))
        .await
        .expect("Failed to seed membership");

    // When: an event older than T arrives late
    let stale = newer - Duration::minutes(5);
    let rows = ledger
        .apply_subscription_update(
            &sub_id,
            MembershipStatus::PastDue,
            None,
            None,
            None,
            false,
            stale,
        )
        .await
        .expect("Update query should succeed");

    // Then: the write is rejected and local state is unchanged
    assert_eq!(rows, 0, "Stale event should not write");
    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Active);

    cleanup_test_data(&pool, venue_id, member_id).await;
}

#[tokio::test]
#[ignore]
async fn test_newer_webhook_applies() {
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let t0 = OffsetDateTime::now_utc() - Duration::minutes(5);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Trialing,
            t0,
        ))
        .await
        .expect("Failed to seed membership");

    let t1 = OffsetDateTime::now_utc();
    let rows = ledger
        .apply_subscription_update(
            &sub_id,
            MembershipStatus::Active,
            None,
            None,
            Some(t1 + Duration::days(30)),
            false,
            t1,
        )
        .await
        .expect("Update query should succeed");

    assert_eq!(rows, 1, "Newer event should write");
    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Active);
    assert_eq!(
        membership.tier_id, tier_id,
        "Update without tier metadata must leave the tier alone"
    );

    cleanup_test_data(&pool, venue_id, member_id).await;
}

#[tokio::test]
#[ignore]
async fn test_cancellation_then_stale_update_stays_cancelled() {
    // Given: a membership cancelled by a subscription.deleted event
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let t0 = OffsetDateTime::now_utc() - Duration::minutes(10);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            t0,
        ))
        .await
        .expect("Failed to seed membership");

    let t2 = OffsetDateTime::now_utc();
    let rows = ledger
        .mark_cancelled(&sub_id, t2)
        .await
        .expect("Cancel should succeed");
    assert_eq!(rows, 1);

    // When: an update event from before the deletion is redelivered
    let t1 = t2 - Duration::minutes(2);
    let rows = ledger
        .apply_subscription_update(&sub_id, MembershipStatus::Active, None, None, None, false, t1)
        .await
        .expect("Update query should succeed");

    // Then: the row stays cancelled
    assert_eq!(rows, 0);
    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Cancelled);

    cleanup_test_data(&pool, venue_id, member_id).await;
}

// ============================================================================
// Test Cases: Optimistic Writes
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_optimistic_write_does_not_block_webhook() {
    // Given: a synced membership, then a local optimistic cancellation
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let t0 = OffsetDateTime::now_utc() - Duration::minutes(1);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            t0,
        ))
        .await
        .expect("Failed to seed membership");

    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    ledger
        .set_cancelled_optimistic(membership.id)
        .await
        .expect("Optimistic cancel should succeed");

    // The optimistic write must not advance the sync watermark
    let after_optimistic = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(after_optimistic.status, MembershipStatus::Cancelled);
    assert_eq!(after_optimistic.processor_synced_at, membership.processor_synced_at);

    // When: the confirming webhook arrives
    let t1 = OffsetDateTime::now_utc();
    let rows = ledger
        .apply_subscription_update(
            &sub_id,
            MembershipStatus::Cancelled,
            None,
            None,
            membership.current_period_end,
            true,
            t1,
        )
        .await
        .expect("Webhook update should succeed");

    // Then: the webhook write applies and advances the watermark
    assert_eq!(rows, 1);
    let confirmed = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(confirmed.status, MembershipStatus::Cancelled);
    assert!(confirmed.cancel_at_period_end);
    assert!(confirmed.processor_synced_at > membership.processor_synced_at);

    cleanup_test_data(&pool, venue_id, member_id).await;
}

#[tokio::test]
#[ignore]
async fn test_tierless_update_preserves_optimistic_tier() {
    // Given: a membership optimistically moved to a second tier after a plan
    // change was accepted by Stripe
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let upgraded_tier_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO membership_tiers (id, venue_id, name, price_cents, currency, created_at, updated_at)
        VALUES ($1, $2, 'Unlimited', 9900, 'aud', NOW(), NOW())
        "#,
    )
    .bind(upgraded_tier_id)
    .bind(venue_id)
    .execute(&pool)
    .await
    .expect("Failed to create upgraded tier");

    let t0 = OffsetDateTime::now_utc() - Duration::minutes(5);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            t0,
        ))
        .await
        .expect("Failed to seed membership");

    let membership = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    ledger
        .set_tier_optimistic(membership.id, upgraded_tier_id)
        .await
        .expect("Optimistic tier write should succeed");

    // When: a newer update event without tier metadata lands
    let t1 = OffsetDateTime::now_utc();
    let rows = ledger
        .apply_subscription_update(
            &sub_id,
            MembershipStatus::Active,
            None,
            None,
            Some(t1 + Duration::days(30)),
            false,
            t1,
        )
        .await
        .expect("Update query should succeed");

    // Then: the event applies but the optimistic tier survives
    assert_eq!(rows, 1);
    let confirmed = ledger.get(venue_id, member_id).await.unwrap().unwrap();
    assert_eq!(confirmed.tier_id, upgraded_tier_id);

    cleanup_test_data(&pool, venue_id, member_id).await;
}

// ============================================================================
// Test Cases: Profile Access Flag
// ============================================================================

async fn membership_active(pool: &PgPool, member_id: Uuid) -> bool {
    let (flag,): (bool,) = sqlx::query_as("SELECT membership_active FROM profiles WHERE id = $1")
        .bind(member_id)
        .fetch_one(pool)
        .await
        .expect("Failed to read profile flag");
    flag
}

#[tokio::test]
#[ignore]
async fn test_profile_access_flag_follows_ledger() {
    // Given: a fresh member whose checkout completes
    let pool = setup_pool().await;
    let (venue_id, member_id, tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());
    let sub_id = format!("sub_test_{}", Uuid::new_v4().simple());

    let t0 = OffsetDateTime::now_utc() - Duration::minutes(10);
    ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            t0,
        ))
        .await
        .expect("Failed to seed membership");
    ledger
        .refresh_profile_access(member_id)
        .await
        .expect("Refresh should succeed");
    assert!(membership_active(&pool, member_id).await);

    // When: the subscription is deleted and the flag is refreshed
    let t1 = OffsetDateTime::now_utc();
    ledger
        .mark_cancelled(&sub_id, t1)
        .await
        .expect("Cancel should succeed");
    ledger
        .refresh_profile_access(member_id)
        .await
        .expect("Refresh should succeed");

    // Then: access is revoked
    assert!(!membership_active(&pool, member_id).await);

    // And: a stale checkout redelivery cannot resurrect it
    let stale = t1 - Duration::minutes(5);
    let rows = ledger
        .upsert_synced(&synced(
            venue_id,
            member_id,
            tier_id,
            &sub_id,
            MembershipStatus::Active,
            stale,
        ))
        .await
        .expect("Upsert query should succeed");
    assert_eq!(rows, 0, "Stale checkout must be rejected");
    ledger
        .refresh_profile_access(member_id)
        .await
        .expect("Refresh should succeed");
    assert!(!membership_active(&pool, member_id).await);

    cleanup_test_data(&pool, venue_id, member_id).await;
}

// ============================================================================
// Test Cases: Payment History
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_payment_history_reads_back() {
    let pool = setup_pool().await;
    let (venue_id, member_id, _tier_id) = create_test_fixtures(&pool).await;
    let ledger = MembershipLedger::new(pool.clone());

    sqlx::query(
        r#"
        INSERT INTO payments
            (id, venue_id, member_id, amount_cents, currency, status, stripe_event_id, stripe_session_id)
        VALUES ($1, $2, $3, $4, 'aud', 'succeeded', $5, 'cs_history_test')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(venue_id)
    .bind(member_id)
    .bind(4900_i64)
    .bind(format!("evt_history_{}", Uuid::new_v4().simple()))
    .execute(&pool)
    .await
    .expect("Failed to insert payment");

    let payments = ledger
        .payments_for_member(venue_id, member_id, 10)
        .await
        .expect("Failed to fetch payments");

    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount_cents, 4900);
    assert_eq!(payments[0].status, PaymentStatus::Succeeded);
    assert_eq!(payments[0].currency, "aud");

    cleanup_test_data(&pool, venue_id, member_id).await;
}

// ============================================================================
// Test Cases: Audit Trail
// ============================================================================

#[tokio::test]
#[ignore]
async fn test_billing_events_are_persisted() {
    let pool = setup_pool().await;
    let (venue_id, member_id, _tier_id) = create_test_fixtures(&pool).await;
    let logger = BillingEventLogger::new(pool.clone());

    let event_id = logger
        .log_event(
            BillingEventBuilder::new(venue_id, BillingEventType::MembershipCancelled)
                .member(member_id)
                .stripe_subscription("sub_audit_test")
                .data(serde_json::json!({"reason": "member request"}))
                .actor_type(ActorType::Member),
        )
        .await
        .expect("Failed to log billing event");

    let events = logger
        .get_events_for_venue(venue_id, 10)
        .await
        .expect("Failed to fetch billing events");

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, event_id);
    assert_eq!(events[0].event_type, "MEMBERSHIP_CANCELLED");
    assert_eq!(events[0].member_id, Some(member_id));
    assert_eq!(events[0].actor_type, "member");

    cleanup_test_data(&pool, venue_id, member_id).await;
}
