//! Billing routes for Stripe integration

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use venuepass_shared::{MemberId, TierId, VenueId};

use crate::{error::ApiError, state::AppState};

/// Request to start a subscription checkout
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub member_id: MemberId,
    pub venue_id: VenueId,
    pub tier_id: TierId,
}

/// Response from starting a checkout session
#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    /// Hosted checkout URL the member should be redirected to
    pub url: String,
}

/// Request to move a member to a different tier
#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub member_id: MemberId,
    pub venue_id: VenueId,
    pub new_tier_id: TierId,
}

/// Request to cancel a membership at period end
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub member_id: MemberId,
    pub venue_id: VenueId,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Membership info response
#[derive(Debug, Serialize)]
pub struct MembershipInfo {
    pub status: String,
    pub has_access: bool,
    pub tier_id: TierId,
    pub trial_ends_at: Option<String>,
    pub current_period_end: Option<String>,
    pub cancel_at_period_end: bool,
}

/// A single payment in a member's history
#[derive(Debug, Serialize)]
pub struct PaymentInfo {
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub created_at: Option<String>,
}

/// Start a subscription checkout for a member joining a venue
pub async fn subscribe(
    State(state): State<AppState>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    let url = state
        .billing
        .checkout
        .start_subscription(req.member_id.0, req.venue_id.0, req.tier_id.0)
        .await?;

    tracing::info!(
        member_id = %req.member_id,
        venue_id = %req.venue_id,
        tier_id = %req.tier_id,
        "Checkout session created"
    );

    Ok(Json(SubscribeResponse { url }))
}

/// Move an active membership to a different tier with proration
pub async fn change_plan(
    State(state): State<AppState>,
    Json(req): Json<ChangePlanRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .billing
        .plans
        .change_tier(req.member_id.0, req.venue_id.0, req.new_tier_id.0)
        .await?;

    tracing::info!(
        member_id = %req.member_id,
        venue_id = %req.venue_id,
        new_tier_id = %req.new_tier_id,
        "Membership tier changed"
    );

    Ok(Json(OkResponse { ok: true }))
}

/// Cancel a membership at the end of the current billing period
pub async fn cancel(
    State(state): State<AppState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .billing
        .plans
        .cancel(req.member_id.0, req.venue_id.0)
        .await?;

    tracing::info!(
        member_id = %req.member_id,
        venue_id = %req.venue_id,
        "Membership cancellation scheduled"
    );

    Ok(Json(OkResponse { ok: true }))
}

/// Get a member's membership at a venue
pub async fn get_membership(
    State(state): State<AppState>,
    Path((venue_id, member_id)): Path<(VenueId, MemberId)>,
) -> Result<Json<MembershipInfo>, ApiError> {
    let membership = state
        .billing
        .memberships
        .get(venue_id.0, member_id.0)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(MembershipInfo {
        status: membership.status.to_string(),
        has_access: membership.status.has_access(),
        tier_id: TierId::from(membership.tier_id),
        trial_ends_at: membership
            .trial_ends_at
            .and_then(|t| t.format(&Rfc3339).ok()),
        current_period_end: membership
            .current_period_end
            .and_then(|t| t.format(&Rfc3339).ok()),
        cancel_at_period_end: membership.cancel_at_period_end,
    }))
}

/// List a member's payments at a venue, newest first
pub async fn list_payments(
    State(state): State<AppState>,
    Path((venue_id, member_id)): Path<(VenueId, MemberId)>,
) -> Result<Json<Vec<PaymentInfo>>, ApiError> {
    let payments = state
        .billing
        .memberships
        .payments_for_member(venue_id.0, member_id.0, 50)
        .await?;

    Ok(Json(
        payments
            .into_iter()
            .map(|p| PaymentInfo {
                amount_cents: p.amount_cents,
                currency: p.currency,
                status: p.status.to_string(),
                created_at: p.created_at.format(&Rfc3339).ok(),
            })
            .collect(),
    ))
}

/// Handle incoming Stripe webhooks
///
/// The raw body is required for signature verification, so this handler
/// takes `String` rather than a typed extractor.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    // Get signature header
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Verify and parse event
    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Handle the event. Retryable failures return 5xx so Stripe redelivers;
    // permanent failures return 4xx so it stops.
    state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        if e.is_retryable() {
            ApiError::Upstream(format!("Webhook handling error: {}", e))
        } else {
            ApiError::BadRequest(format!("Webhook handling error: {}", e))
        }
    })?;

    tracing::info!("Stripe webhook processed successfully");

    Ok(StatusCode::OK)
}
