#!/usr/bin/env rust-script
//! Membership Consistency Verification Script
//!
//! Detects database/Stripe drift for VenuePass memberships.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_membership_consistency > drift_report.txt
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - STRIPE_SECRET_KEY: Stripe API key (production or test mode)

use std::env;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("VenuePass Membership Consistency Verification");
    println!("=============================================\n");

    // Load environment variables
    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL")
        .expect("DATABASE_URL must be set");

    let stripe_key = env::var("STRIPE_SECRET_KEY")
        .expect("STRIPE_SECRET_KEY must be set");

    // Initialize database connection
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;

    // Initialize Stripe client
    let stripe_client = stripe::Client::new(stripe_key);

    println!("✓ Connected to database");
    println!("✓ Connected to Stripe API\n");

    // ========================================================================
    // Check 1: Non-cancelled memberships have a subscription id
    // ========================================================================
    println!("Check 1: Verifying live memberships have subscription ids...");

    let memberships_without_sub: Vec<(uuid::Uuid, uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT id, member_id, status
        FROM memberships
        WHERE status IN ('trialing', 'active', 'past_due')
          AND (stripe_subscription_id IS NULL OR stripe_subscription_id = '')
        "#
    )
    .fetch_all(&pool)
    .await?;

    if memberships_without_sub.is_empty() {
        println!("  ✓ All live memberships have subscription ids");
    } else {
        println!("  ⚠ Found {} live memberships without a subscription", memberships_without_sub.len());
        for (id, member_id, status) in &memberships_without_sub {
            println!("    - membership {}: member {} ({})", id, member_id, status);
        }
    }

    // ========================================================================
    // Check 2: Membership statuses match Stripe
    // ========================================================================
    println!("\nCheck 2: Verifying membership statuses match Stripe...");

    let db_memberships: Vec<(uuid::Uuid, uuid::Uuid, String, String)> = sqlx::query_as(
        r#"
        SELECT id, member_id, stripe_subscription_id, status
        FROM memberships
        WHERE status IN ('trialing', 'active', 'past_due')
          AND stripe_subscription_id IS NOT NULL
        "#
    )
    .fetch_all(&pool)
    .await?;

    let mut status_mismatches = Vec::new();

    for (id, member_id, sub_id, db_status) in &db_memberships {
        match stripe::Subscription::retrieve(&stripe_client, &sub_id.parse()?, &[]).await {
            Ok(stripe_sub) => {
                let stripe_status = format!("{:?}", stripe_sub.status);
                if !matches!(
                    stripe_sub.status,
                    stripe::SubscriptionStatus::Active
                        | stripe::SubscriptionStatus::Trialing
                        | stripe::SubscriptionStatus::PastDue
                ) {
                    status_mismatches.push((id, member_id, db_status.clone(), stripe_status));
                }
            }
            Err(_) => {
                status_mismatches.push((id, member_id, db_status.clone(), "DELETED".to_string()));
            }
        }
    }

    if status_mismatches.is_empty() {
        println!("  ✓ All live membership statuses match Stripe");
    } else {
        println!("  ⚠ Found {} status mismatches", status_mismatches.len());
        for (id, member_id, db_status, stripe_status) in &status_mismatches {
            println!(
                "    - membership {}: member {} (DB: {}, Stripe: {})",
                id, member_id, db_status, stripe_status
            );
        }
    }

    // ========================================================================
    // Check 3: membership_active flag agrees with the ledger
    // ========================================================================
    println!("\nCheck 3: Verifying profile access flags agree with the ledger...");

    let flag_mismatches: Vec<(uuid::Uuid, String, bool)> = sqlx::query_as(
        r#"
        SELECT p.id, p.email, p.membership_active
        FROM profiles p
        WHERE p.membership_active != EXISTS (
            SELECT 1 FROM memberships m
            WHERE m.member_id = p.id
              AND m.status IN ('trialing', 'active')
        )
        "#
    )
    .fetch_all(&pool)
    .await?;

    if flag_mismatches.is_empty() {
        println!("  ✓ All profile access flags agree with the ledger");
    } else {
        println!("  ⚠ Found {} profiles with stale access flags", flag_mismatches.len());
        for (id, email, flag) in &flag_mismatches {
            println!("    - {}: {} (membership_active = {})", id, email, flag);
        }
    }

    // ========================================================================
    // Check 4: Tiers in use have provisioned prices
    // ========================================================================
    println!("\nCheck 4: Verifying tiers in use have Stripe prices...");

    let unprovisioned_tiers: Vec<(uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT DISTINCT t.id, t.name
        FROM membership_tiers t
        JOIN memberships m ON m.tier_id = t.id
        WHERE m.status IN ('trialing', 'active', 'past_due')
          AND (t.stripe_price_id IS NULL OR t.stripe_price_id = '')
        "#
    )
    .fetch_all(&pool)
    .await?;

    if unprovisioned_tiers.is_empty() {
        println!("  ✓ All tiers in use have Stripe prices");
    } else {
        println!("  ⚠ Found {} tiers in use without a price", unprovisioned_tiers.len());
        for (id, name) in &unprovisioned_tiers {
            println!("    - {}: {}", id, name);
        }
    }

    // ========================================================================
    // Summary Report
    // ========================================================================
    println!("\n========================================");
    println!("Summary");
    println!("========================================");

    let total_issues = memberships_without_sub.len()
        + status_mismatches.len()
        + flag_mismatches.len()
        + unprovisioned_tiers.len();

    if total_issues == 0 {
        println!("✓ No membership inconsistencies detected!");
    } else {
        println!("⚠ Found {} total issues", total_issues);
        println!("\nRecommendations:");
        println!("1. Check stripe_webhook_events for rows stuck in 'processing'");
        println!("2. Replay missed events from the Stripe dashboard");
        println!("3. Review billing_events for the affected members");
    }

    Ok(())
}
