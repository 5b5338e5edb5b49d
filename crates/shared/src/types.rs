//! Core domain types for VenuePass.
//!
//! Typed ID wrappers, VARCHAR-backed enums, and the database models for the
//! membership ledger. Enums are stored as lowercase strings so rows stay
//! readable in psql and in Stripe metadata dumps.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Venue ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(pub Uuid);

impl VenueId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for VenueId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for VenueId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Member ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MemberId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Membership tier ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TierId(pub Uuid);

impl TierId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TierId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TierId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Role of a profile within the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Owner,
    Admin,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Member => write!(f, "member"),
            MemberRole::Owner => write!(f, "owner"),
            MemberRole::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(MemberRole::Member),
            "owner" => Ok(MemberRole::Owner),
            "admin" => Ok(MemberRole::Admin),
            _ => Err(format!("Invalid member role: {}", s)),
        }
    }
}

/// Local membership status, mirrored from the payment processor's report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Trialing,
    Active,
    PastDue,
    Cancelled,
}

impl MembershipStatus {
    /// Whether this status grants access to the venue
    pub fn has_access(&self) -> bool {
        matches!(self, MembershipStatus::Trialing | MembershipStatus::Active)
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipStatus::Trialing => write!(f, "trialing"),
            MembershipStatus::Active => write!(f, "active"),
            MembershipStatus::PastDue => write!(f, "past_due"),
            MembershipStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for MembershipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trialing" => Ok(MembershipStatus::Trialing),
            "active" => Ok(MembershipStatus::Active),
            "past_due" => Ok(MembershipStatus::PastDue),
            "cancelled" => Ok(MembershipStatus::Cancelled),
            _ => Err(format!("Invalid membership status: {}", s)),
        }
    }
}

/// Recorded outcome of a payment event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentStatus::Succeeded => write!(f, "succeeded"),
            PaymentStatus::Pending => write!(f, "pending"),
            PaymentStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "pending" => Ok(PaymentStatus::Pending),
            "failed" => Ok(PaymentStatus::Failed),
            _ => Err(format!("Invalid payment status: {}", s)),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// A venue tenant. `trial_days` feeds straight into checkout session creation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Venue {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub trial_days: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A member profile. `stripe_customer_id` is written once on first checkout
/// and never overwritten afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: MemberRole,
    pub membership_active: bool,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A priced membership tier owned by a venue. `stripe_price_id` starts NULL
/// and is filled in lazily the first time the tier is checked out.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MembershipTier {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub name: String,
    pub price_cents: i32,
    pub currency: String,
    pub stripe_price_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A member's subscription to a venue. One row per (venue, member), never
/// hard-deleted; cancellation and resubscription reuse the same row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub member_id: Uuid,
    pub tier_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub status: MembershipStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Processor timestamp of the last webhook event applied to this row.
    /// Optimistic local writes do not advance it.
    pub processor_synced_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A recorded payment, deduplicated by processor event id
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub member_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub stripe_event_id: String,
    pub stripe_session_id: Option<String>,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_venue_id_display_roundtrip() {
        let id = VenueId::new();
        let parsed = Uuid::parse_str(&id.to_string()).unwrap();
        assert_eq!(id, VenueId::from(parsed));
    }

    #[test]
    fn test_id_wrappers_serialize_transparent() {
        let id = MemberId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.0));
        let back: MemberId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_member_role_display() {
        assert_eq!(MemberRole::Member.to_string(), "member");
        assert_eq!(MemberRole::Owner.to_string(), "owner");
        assert_eq!(MemberRole::Admin.to_string(), "admin");
    }

    #[test]
    fn test_member_role_from_str() {
        assert_eq!(MemberRole::from_str("owner").unwrap(), MemberRole::Owner);
        assert!(MemberRole::from_str("superuser").is_err());
    }

    #[test]
    fn test_membership_status_display() {
        assert_eq!(MembershipStatus::Trialing.to_string(), "trialing");
        assert_eq!(MembershipStatus::Active.to_string(), "active");
        assert_eq!(MembershipStatus::PastDue.to_string(), "past_due");
        assert_eq!(MembershipStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn test_membership_status_from_str() {
        assert_eq!(
            MembershipStatus::from_str("past_due").unwrap(),
            MembershipStatus::PastDue
        );
        assert_eq!(
            MembershipStatus::from_str("cancelled").unwrap(),
            MembershipStatus::Cancelled
        );
        assert!(MembershipStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_membership_status_access() {
        assert!(MembershipStatus::Trialing.has_access());
        assert!(MembershipStatus::Active.has_access());
        assert!(!MembershipStatus::PastDue.has_access());
        assert!(!MembershipStatus::Cancelled.has_access());
    }

    #[test]
    fn test_payment_status_roundtrip() {
        for status in [
            PaymentStatus::Succeeded,
            PaymentStatus::Pending,
            PaymentStatus::Failed,
        ] {
            let parsed = PaymentStatus::from_str(&status.to_string()).unwrap();
            assert_eq!(parsed, status);
        }
    }
}
