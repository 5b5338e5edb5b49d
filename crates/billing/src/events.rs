//! Billing Events Module
//!
//! Provides append-only billing event logging for audit trails and debugging.
//! Events capture every ledger mutation and can be used to:
//! - Answer "why is this member on this tier?" questions
//! - Reconstruct a membership's billing history
//! - Compliance and audit requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Membership lifecycle
    MembershipCreated,
    MembershipUpdated,
    MembershipCancelled,
    TierChanged,

    // Payments
    PaymentRecorded,
    PaymentFailed,

    // Stripe resource lifecycle
    PriceProvisioned,
    CustomerCreated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::MembershipCreated => "MEMBERSHIP_CREATED",
            BillingEventType::MembershipUpdated => "MEMBERSHIP_UPDATED",
            BillingEventType::MembershipCancelled => "MEMBERSHIP_CANCELLED",
            BillingEventType::TierChanged => "TIER_CHANGED",
            BillingEventType::PaymentRecorded => "PAYMENT_RECORDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::PriceProvisioned => "PRICE_PROVISIONED",
            BillingEventType::CustomerCreated => "CUSTOMER_CREATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// Member through the app
    Member,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Member => write!(f, "member"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub member_id: Option<Uuid>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    venue_id: Uuid,
    member_id: Option<Uuid>,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(venue_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            venue_id,
            member_id: None,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the member the event concerns
    pub fn member(mut self, member_id: Uuid) -> Self {
        self.member_id = Some(member_id);
        self
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the Stripe event ID
    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    /// Set the Stripe subscription ID
    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    /// Set the actor type
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                venue_id,
                member_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.venue_id)
        .bind(builder.member_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Get recent events for a venue
    pub async fn get_events_for_venue(
        &self,
        venue_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT
                id,
                venue_id,
                member_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                actor_type,
                created_at
            FROM billing_events
            WHERE venue_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(venue_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Get events related to a specific Stripe subscription
    pub async fn get_events_for_subscription(
        &self,
        stripe_subscription_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT
                id,
                venue_id,
                member_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                actor_type,
                created_at
            FROM billing_events
            WHERE stripe_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillingEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            venue_id: row.try_get("venue_id")?,
            member_id: row.try_get("member_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            stripe_event_id: row.try_get("stripe_event_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
