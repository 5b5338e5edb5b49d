//! Stripe customer management
//!
//! Customers are created lazily on first checkout and tagged with the member
//! and venue they belong to. The local `profiles.stripe_customer_id` column is
//! write-once: if two subscribe requests race, the first persisted id wins and
//! the loser adopts it.

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Customer service for managing Stripe customers
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Get the Stripe customer for a member profile, creating one if the
    /// profile has never been billed before.
    pub async fn get_or_create_customer(
        &self,
        member_id: Uuid,
        venue_id: Uuid,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<CustomerId> {
        // Check if the profile already has a Stripe customer ID
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM profiles WHERE id = $1")
                .bind(member_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((Some(customer_id),)) = existing {
            return customer_id
                .parse::<CustomerId>()
                .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)));
        }

        self.create_customer(member_id, venue_id, email, name).await
    }

    /// Create a new Stripe customer tagged with the member and venue
    async fn create_customer(
        &self,
        member_id: Uuid,
        venue_id: Uuid,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<CustomerId> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("member_id".to_string(), member_id.to_string());
        metadata.insert("venue_id".to_string(), venue_id.to_string());

        let params = CreateCustomer {
            email: Some(email),
            name,
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        // Write-once: only persist if no concurrent request beat us to it
        let persisted = sqlx::query(
            "UPDATE profiles SET stripe_customer_id = $1, updated_at = NOW() \
             WHERE id = $2 AND stripe_customer_id IS NULL",
        )
        .bind(customer.id.as_str())
        .bind(member_id)
        .execute(&self.pool)
        .await?;

        if persisted.rows_affected() == 0 {
            // A concurrent subscribe won the race; adopt its customer id
            let winner: Option<(Option<String>,)> =
                sqlx::query_as("SELECT stripe_customer_id FROM profiles WHERE id = $1")
                    .bind(member_id)
                    .fetch_optional(&self.pool)
                    .await?;

            if let Some((Some(winner_id),)) = winner {
                tracing::warn!(
                    member_id = %member_id,
                    orphaned_customer_id = %customer.id,
                    adopted_customer_id = %winner_id,
                    "Lost customer creation race, adopting persisted customer"
                );
                return winner_id
                    .parse::<CustomerId>()
                    .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)));
            }

            return Err(BillingError::NotFound(format!(
                "Profile not found: {}",
                member_id
            )));
        }

        tracing::info!(
            member_id = %member_id,
            venue_id = %venue_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id)
    }
}
