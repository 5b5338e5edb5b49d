//! Lazy Stripe catalog provisioning
//!
//! Venue owners define tiers as plain ledger rows with no Stripe footprint.
//! The first checkout against a tier creates the product and recurring price
//! on demand and persists the price ref back onto the tier. Persisting uses a
//! compare-and-set on NULL so concurrent first checkouts converge on a single
//! price; the loser's freshly created price is left orphaned in Stripe and
//! logged.

use std::collections::HashMap;

use sqlx::PgPool;
use stripe::{
    CreatePrice, CreatePriceRecurring, CreatePriceRecurringInterval, CreateProduct, Currency,
    IdOrCreate, Price, Product,
};
use uuid::Uuid;
use venuepass_shared::{MembershipTier, Venue};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Provisions Stripe products and prices for membership tiers
pub struct PriceProvisioner {
    stripe: StripeClient,
    pool: PgPool,
}

impl PriceProvisioner {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Return the Stripe price id for a tier, creating the product and price
    /// on first use. A tier that already carries a price ref returns it
    /// without any Stripe calls.
    pub async fn ensure_price(&self, venue: &Venue, tier: &MembershipTier) -> BillingResult<String> {
        if let Some(price_id) = &tier.stripe_price_id {
            return Ok(price_id.clone());
        }

        let currency = tier
            .currency
            .to_lowercase()
            .parse::<Currency>()
            .map_err(|_| {
                BillingError::InvalidInput(format!("Unsupported currency: {}", tier.currency))
            })?;

        let metadata = catalog_metadata(tier.venue_id, tier.id);

        let product_name = format!("{} - {}", venue.name, tier.name);
        let mut product_params = CreateProduct::new(&product_name);
        product_params.metadata = Some(metadata.clone());
        let product = Product::create(self.stripe.inner(), product_params).await?;

        let mut price_params = CreatePrice::new(currency);
        price_params.product = Some(IdOrCreate::Id(product.id.as_str()));
        price_params.unit_amount = Some(i64::from(tier.price_cents));
        price_params.recurring = Some(CreatePriceRecurring {
            interval: CreatePriceRecurringInterval::Month,
            ..Default::default()
        });
        price_params.metadata = Some(metadata);
        let price = Price::create(self.stripe.inner(), price_params).await?;

        // Compare-and-set: only the first writer fills the column
        let persisted = sqlx::query(
            "UPDATE membership_tiers SET stripe_price_id = $1, updated_at = NOW() \
             WHERE id = $2 AND stripe_price_id IS NULL",
        )
        .bind(price.id.as_str())
        .bind(tier.id)
        .execute(&self.pool)
        .await?;

        if persisted.rows_affected() == 0 {
            // Concurrent checkout provisioned this tier first; use its price
            let winner: Option<(Option<String>,)> =
                sqlx::query_as("SELECT stripe_price_id FROM membership_tiers WHERE id = $1")
                    .bind(tier.id)
                    .fetch_optional(&self.pool)
                    .await?;

            if let Some((Some(winner_id),)) = winner {
                tracing::warn!(
                    tier_id = %tier.id,
                    orphaned_price_id = %price.id,
                    adopted_price_id = %winner_id,
                    "Lost price provisioning race, adopting persisted price"
                );
                return Ok(winner_id);
            }

            return Err(BillingError::NotFound(format!(
                "Membership tier not found: {}",
                tier.id
            )));
        }

        tracing::info!(
            venue_id = %tier.venue_id,
            tier_id = %tier.id,
            product_id = %product.id,
            price_id = %price.id,
            "Provisioned Stripe price for tier"
        );

        Ok(price.id.to_string())
    }
}

/// Metadata stamped on provisioned products and prices so Stripe objects can
/// be traced back to their ledger rows.
fn catalog_metadata(venue_id: Uuid, tier_id: Uuid) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("venue_id".to_string(), venue_id.to_string());
    metadata.insert("tier_id".to_string(), tier_id.to_string());
    metadata
}
