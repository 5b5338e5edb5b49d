//! Stripe webhook processing
//!
//! The webhook endpoint is the authoritative write path for the membership
//! ledger. Every event is verified, claimed atomically in
//! `stripe_webhook_events` (so concurrent or redelivered copies of the same
//! event process at most once), dispatched to a handler, and its outcome
//! written back for operational visibility.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, Event, EventObject, EventType, Invoice, Subscription, SubscriptionId, Webhook,
};
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::memberships::{map_processor_status, MembershipLedger, SyncedMembership};

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed clock skew between the signature timestamp and now
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Events stuck in 'processing' longer than this are assumed to belong to a
/// crashed worker and may be reclaimed
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Handles incoming Stripe webhook events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    email: BillingEmailService,
    ledger: MembershipLedger,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, email: BillingEmailService) -> Self {
        Self {
            stripe,
            ledger: MembershipLedger::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool.clone()),
            pool,
            email,
        }
    }

    /// Verify a webhook payload against its `stripe-signature` header and
    /// parse it into an event. Nothing is written on verification failure.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let secret = &self.stripe.config().webhook_secret;

        // The library verifier rejects payloads from newer Stripe API
        // versions than it was generated for, so fall back to manual HMAC
        // verification and parse the JSON ourselves
        if let Ok(event) = Webhook::construct_event(payload, signature, secret) {
            return Ok(event);
        }

        verify_signature(payload, signature, secret, unix_now())?;

        serde_json::from_str::<Event>(payload).map_err(|e| {
            BillingError::InvalidInput(format!("Failed to parse webhook payload: {}", e))
        })
    }

    /// Claim and process a verified event. Returns Ok(()) for duplicates and
    /// expected no-ops; errors are propagated so the route can 5xx and Stripe
    /// redelivers.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_;
        let event_timestamp = timestamp_from_unix(event.created);

        let claimed = self
            .claim_event(&event_id, &event_type.to_string(), event_timestamp)
            .await?;

        if !claimed {
            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await?;

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                previous_result = ?existing.map(|(r,)| r),
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        let result = self.process_event_internal(event).await;

        match &result {
            Ok(()) => {
                self.record_result(&event_id, "success", None).await;
            }
            Err(e) => {
                self.record_result(&event_id, "error", Some(&e.to_string()))
                    .await;
            }
        }

        result
    }

    /// Atomic claim on the event id. A fresh event inserts its claim row; a
    /// redelivered event reclaims the row when the previous attempt ended in
    /// 'error' or its claim has sat in 'processing' past the timeout. Stripe
    /// redelivery is the only retry loop here, so a failed attempt must stay
    /// claimable; only 'success' rows and live in-flight claims block.
    /// Returns false when the event should be skipped.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE
            SET processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = NULL
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Write the processing outcome back onto the claim row, with one retry.
    /// A lost write-back means the event can be reclaimed after the timeout,
    /// which is safe because every handler is idempotent.
    async fn record_result(&self, event_id: &str, result: &str, error_message: Option<&str>) {
        for attempt in 0..2 {
            let written = sqlx::query(
                "UPDATE stripe_webhook_events \
                 SET processing_result = $2, error_message = $3, processed_at = NOW() \
                 WHERE stripe_event_id = $1",
            )
            .bind(event_id)
            .bind(result)
            .bind(error_message)
            .execute(&self.pool)
            .await;

            match written {
                Ok(_) => return,
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        attempt = attempt,
                        error = %e,
                        "Failed to record webhook processing result"
                    );
                }
            }
        }
    }

    async fn process_event_internal(&self, event: Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::CustomerSubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,
            EventType::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type, ignoring");
                Ok(())
            }
        }
    }

    /// checkout.session.completed: the membership row is born (or reborn)
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_timestamp = timestamp_from_unix(event.created);
        let session = extract_checkout_session(event)?;

        let Some((member_id, venue_id, Some(tier_id))) =
            routing_from_metadata(session.metadata.as_ref())
        else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session missing routing metadata, skipping"
            );
            return Ok(());
        };

        let Some(subscription_ref) = session.subscription.as_ref() else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session has no subscription, skipping"
            );
            return Ok(());
        };
        let subscription_id = subscription_ref
            .id()
            .to_string()
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        // The session snapshot can be stale by the time we process it;
        // retrieve the live subscription for status and period fields
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;

        let Some(status) =
            map_processor_status(subscription.status, subscription.cancel_at_period_end)
        else {
            tracing::warn!(
                subscription_id = %subscription_id,
                status = ?subscription.status,
                "Subscription in half-open state at checkout completion, deferring to later events"
            );
            return Ok(());
        };

        let synced = SyncedMembership {
            venue_id,
            member_id,
            tier_id,
            stripe_subscription_id: subscription_id.to_string(),
            status,
            trial_ends_at: subscription
                .trial_end
                .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
            current_period_end: OffsetDateTime::from_unix_timestamp(
                subscription.current_period_end,
            )
            .ok(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            event_timestamp,
        };

        let written = self.ledger.upsert_synced(&synced).await?;
        if written == 0 {
            // The access flag stays untouched so a stale redelivery cannot
            // resurrect access the ledger has since revoked
            tracing::info!(
                event_id = %event_id,
                subscription_id = %subscription_id,
                "Stale checkout event, newer state already applied"
            );
        } else {
            self.ledger.refresh_profile_access(member_id).await?;
        }

        // Payment record dedupes on the event id: a redelivered event makes
        // no second row and sends no second welcome email
        let payment = sqlx::query(
            r#"
            INSERT INTO payments
                (id, venue_id, member_id, amount_cents, currency, status, stripe_event_id, stripe_session_id)
            VALUES ($1, $2, $3, $4, $5, 'succeeded', $6, $7)
            ON CONFLICT (stripe_event_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(venue_id)
        .bind(member_id)
        .bind(session.amount_total.unwrap_or(0))
        .bind(
            session
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "aud".to_string()),
        )
        .bind(&event_id)
        .bind(session.id.as_str())
        .execute(&self.pool)
        .await?;

        if payment.rows_affected() > 0 {
            self.send_welcome_email(member_id, venue_id, tier_id).await;

            self.event_logger
                .log_event(
                    BillingEventBuilder::new(venue_id, BillingEventType::MembershipCreated)
                        .member(member_id)
                        .stripe_event(&event_id)
                        .stripe_subscription(subscription_id.as_str())
                        .data(serde_json::json!({
                            "tier_id": tier_id,
                            "status": status.to_string(),
                        }))
                        .actor_type(ActorType::Stripe),
                )
                .await?;

            self.event_logger
                .log_event(
                    BillingEventBuilder::new(venue_id, BillingEventType::PaymentRecorded)
                        .member(member_id)
                        .stripe_event(&event_id)
                        .data(serde_json::json!({
                            "amount_cents": session.amount_total.unwrap_or(0),
                            "session_id": session.id.as_str(),
                        }))
                        .actor_type(ActorType::Stripe),
                )
                .await?;
        }

        tracing::info!(
            member_id = %member_id,
            venue_id = %venue_id,
            tier_id = %tier_id,
            subscription_id = %subscription_id,
            status = %status,
            "Processed checkout completion"
        );

        Ok(())
    }

    /// customer.subscription.updated: mirror status, trial, and period
    async fn handle_subscription_updated(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_timestamp = timestamp_from_unix(event.created);
        let subscription = extract_subscription(event)?;

        let Some((member_id, venue_id, tier_id)) =
            routing_from_metadata(Some(&subscription.metadata))
        else {
            // Subscriptions created outside the app (e.g. test objects in the
            // Stripe dashboard) carry no routing metadata and cannot be
            // applied; erroring would make Stripe redeliver forever
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription update without routing metadata, skipping"
            );
            return Ok(());
        };

        let Some(status) =
            map_processor_status(subscription.status, subscription.cancel_at_period_end)
        else {
            tracing::info!(
                subscription_id = %subscription.id,
                status = ?subscription.status,
                "Subscription status does not map to a local status, skipping"
            );
            return Ok(());
        };

        let written = self
            .ledger
            .apply_subscription_update(
                subscription.id.as_str(),
                status,
                tier_id,
                subscription
                    .trial_end
                    .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok(),
                subscription.cancel_at_period_end,
                event_timestamp,
            )
            .await?;

        if written == 0 {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription update matched no row or was stale, skipping"
            );
            return Ok(());
        }

        self.ledger.refresh_profile_access(member_id).await?;

        self.event_logger
            .log_event(
                BillingEventBuilder::new(venue_id, BillingEventType::MembershipUpdated)
                    .member(member_id)
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .data(serde_json::json!({
                        "status": status.to_string(),
                        "cancel_at_period_end": subscription.cancel_at_period_end,
                        "tier_id": tier_id,
                    }))
                    .actor_type(ActorType::Stripe),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            status = %status,
            "Mirrored subscription update"
        );

        Ok(())
    }

    /// customer.subscription.deleted: terminal cancellation
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_timestamp = timestamp_from_unix(event.created);
        let subscription = extract_subscription(event)?;

        let written = self
            .ledger
            .mark_cancelled(subscription.id.as_str(), event_timestamp)
            .await?;

        if written == 0 {
            tracing::info!(
                subscription_id = %subscription.id,
                "Deletion for unknown or already-newer subscription, skipping"
            );
            return Ok(());
        }

        if let Some(membership) = self.ledger.get_by_subscription(subscription.id.as_str()).await? {
            self.ledger
                .refresh_profile_access(membership.member_id)
                .await?;

            let end_date = membership
                .current_period_end
                .and_then(|ts| ts.format(&Rfc3339).ok())
                .unwrap_or_else(|| "the end of the current period".to_string());

            if let Some((email, venue_name)) = self
                .member_contact(membership.member_id, membership.venue_id)
                .await?
            {
                let _ = self
                    .email
                    .send_membership_cancelled(&email, &venue_name, &end_date)
                    .await;
            }

            self.event_logger
                .log_event(
                    BillingEventBuilder::new(
                        membership.venue_id,
                        BillingEventType::MembershipCancelled,
                    )
                    .member(membership.member_id)
                    .stripe_event(&event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::Stripe),
                )
                .await?;
        }

        tracing::info!(
            subscription_id = %subscription.id,
            "Processed subscription deletion"
        );

        Ok(())
    }

    /// invoice.payment_failed: membership falls past due
    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_timestamp = timestamp_from_unix(event.created);
        let invoice = extract_invoice(event)?;

        let Some(subscription_ref) = invoice.subscription.as_ref() else {
            tracing::info!(
                invoice_id = %invoice.id,
                "Payment failure on a non-subscription invoice, ignoring"
            );
            return Ok(());
        };
        let subscription_id = subscription_ref.id().to_string();

        let written = self
            .ledger
            .mark_past_due(&subscription_id, event_timestamp)
            .await?;

        if written == 0 {
            tracing::info!(
                subscription_id = %subscription_id,
                "Payment failure for unknown or already-newer subscription, skipping"
            );
            return Ok(());
        }

        if let Some(membership) = self.ledger.get_by_subscription(&subscription_id).await? {
            self.ledger
                .refresh_profile_access(membership.member_id)
                .await?;

            if let Some((email, venue_name)) = self
                .member_contact(membership.member_id, membership.venue_id)
                .await?
            {
                let _ = self
                    .email
                    .send_membership_past_due(&email, &venue_name)
                    .await;
            }

            self.event_logger
                .log_event(
                    BillingEventBuilder::new(membership.venue_id, BillingEventType::PaymentFailed)
                        .member(membership.member_id)
                        .stripe_event(&event_id)
                        .stripe_subscription(&subscription_id)
                        .data(serde_json::json!({
                            "invoice_id": invoice.id.as_str(),
                            "amount_due_cents": invoice.amount_due,
                        }))
                        .actor_type(ActorType::Stripe),
                )
                .await?;
        }

        tracing::info!(
            subscription_id = %subscription_id,
            "Marked membership past due after failed payment"
        );

        Ok(())
    }

    async fn send_welcome_email(&self, member_id: Uuid, venue_id: Uuid, tier_id: Uuid) {
        let details: Result<Option<(String, String, String)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT p.email, v.name, t.name
            FROM profiles p, venues v, membership_tiers t
            WHERE p.id = $1 AND v.id = $2 AND t.id = $3
            "#,
        )
        .bind(member_id)
        .bind(venue_id)
        .bind(tier_id)
        .fetch_optional(&self.pool)
        .await;

        if let Ok(Some((email, venue_name, tier_name))) = details {
            let _ = self
                .email
                .send_membership_welcome(&email, &venue_name, &tier_name)
                .await;
        }
    }

    async fn member_contact(
        &self,
        member_id: Uuid,
        venue_id: Uuid,
    ) -> BillingResult<Option<(String, String)>> {
        let contact: Option<(String, String)> = sqlx::query_as(
            "SELECT p.email, v.name FROM profiles p, venues v WHERE p.id = $1 AND v.id = $2",
        )
        .bind(member_id)
        .bind(venue_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(contact)
    }
}

fn extract_checkout_session(event: Event) -> BillingResult<CheckoutSession> {
    match event.data.object {
        EventObject::CheckoutSession(session) => Ok(session),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected CheckoutSession object".to_string(),
        )),
    }
}

fn extract_subscription(event: Event) -> BillingResult<Subscription> {
    match event.data.object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription object".to_string(),
        )),
    }
}

fn extract_invoice(event: Event) -> BillingResult<Invoice> {
    match event.data.object {
        EventObject::Invoice(invoice) => Ok(invoice),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Invoice object".to_string(),
        )),
    }
}

/// Pull ledger routing out of processor metadata. Returns None when member or
/// venue is missing or malformed; the tier id is optional because tier-less
/// updates must not touch the locally chosen tier.
fn routing_from_metadata(
    metadata: Option<&HashMap<String, String>>,
) -> Option<(Uuid, Uuid, Option<Uuid>)> {
    let metadata = metadata?;
    let member_id = metadata
        .get("member_id")
        .and_then(|id| Uuid::parse_str(id).ok())?;
    let venue_id = metadata
        .get("venue_id")
        .and_then(|id| Uuid::parse_str(id).ok())?;
    let tier_id = metadata
        .get("tier_id")
        .and_then(|id| Uuid::parse_str(id).ok());
    Some((member_id, venue_id, tier_id))
}

/// Manually verify a Stripe signature header against the raw payload.
/// Header format: `t=<unix>,v1=<hex hmac>[,v1=...]`
fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidate_signatures: Vec<&str> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidate_signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if candidate_signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // Replay protection: reject signatures outside the tolerance window
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| BillingError::Internal(format!("HMAC key error: {}", e)))?;
    mac.update(signed_payload.as_bytes());
    let expected = mac.finalize().into_bytes();

    for candidate in candidate_signatures {
        if let Ok(candidate_bytes) = hex::decode(candidate) {
            if candidate_bytes.len() == expected.len()
                && bool::from(candidate_bytes.as_slice().ct_eq(expected.as_slice()))
            {
                return Ok(());
            }
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn timestamp_from_unix(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or_else(|_| OffsetDateTime::now_utc())
}
