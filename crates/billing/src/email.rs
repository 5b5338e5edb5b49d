//! Email notifications for billing events
//!
//! Sends transactional emails via Resend API for membership lifecycle events.

use crate::error::BillingResult;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "VenuePass <noreply@venuepass.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "VenuePass".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@venuepass.app".to_string()),
            dashboard_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent successfully,
    /// `Ok(false)` if sending failed (non-fatal - doesn't propagate error),
    /// `Err` only for critical configuration issues.
    ///
    /// The `Ok(false)` return allows callers to track email delivery status
    /// while not failing webhook processing due to email errors.
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false) // Don't fail webhooks due to email errors
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false) // Don't fail webhooks due to email errors
            }
        }
    }

    /// Send welcome email after a member's first successful checkout
    pub async fn send_membership_welcome(
        &self,
        to: &str,
        venue_name: &str,
        tier_name: &str,
    ) -> BillingResult<bool> {
        let dashboard_link = format!("{}/dashboard/venues", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #16a34a;">Welcome to {venue_name}!</h2>
    <p>Hi there,</p>
    <p>Your <strong>{tier_name}</strong> membership at <strong>{venue_name}</strong> is now active.</p>
    <p>You can manage your membership, view payment history, and change your plan at any time from your dashboard.</p>
    <p>
        <a href="{dashboard_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Go to Dashboard
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            venue_name = venue_name,
            tier_name = tier_name,
            dashboard_link = dashboard_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Welcome to {} - {}", venue_name, self.config.app_name),
            &html,
        )
        .await
    }

    /// Send membership past due notification
    pub async fn send_membership_past_due(
        &self,
        to: &str,
        venue_name: &str,
    ) -> BillingResult<bool> {
        let billing_link = format!("{}/dashboard/venues", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #dc2626;">Membership Payment Past Due</h2>
    <p>Hi there,</p>
    <p>We weren't able to process the latest payment for your membership at <strong>{venue_name}</strong>.</p>
    <p>Please update your payment method to keep your membership active. Your access may be suspended if payment is not received soon.</p>
    <p>
        <a href="{billing_link}" style="display: inline-block; padding: 12px 24px; background-color: #dc2626; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Update Payment Now
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Need help? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            venue_name = venue_name,
            billing_link = billing_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!(
                "Action Required: Membership Past Due - {}",
                self.config.app_name
            ),
            &html,
        )
        .await
    }

    /// Send membership cancelled confirmation
    pub async fn send_membership_cancelled(
        &self,
        to: &str,
        venue_name: &str,
        end_date: &str,
    ) -> BillingResult<bool> {
        let resubscribe_link = format!("{}/dashboard/venues", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #333;">Membership Cancelled</h2>
    <p>Hi there,</p>
    <p>Your membership at <strong>{venue_name}</strong> has been cancelled.</p>
    <p>You'll continue to have access until <strong>{end_date}</strong>. After that, your membership ends.</p>
    <p>Changed your mind? You can rejoin anytime.</p>
    <p>
        <a href="{resubscribe_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Rejoin
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            venue_name = venue_name,
            end_date = end_date,
            resubscribe_link = resubscribe_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Membership Cancelled - {}", self.config.app_name),
            &html,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_disabled_without_api_key() {
        let config = EmailConfig {
            resend_api_key: String::new(),
            email_from: "VenuePass <noreply@venuepass.app>".to_string(),
            app_name: "VenuePass".to_string(),
            support_email: "support@venuepass.app".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
        };
        assert!(!config.is_enabled());
    }

    #[test]
    fn test_email_enabled_with_api_key() {
        let config = EmailConfig {
            resend_api_key: "re_test_key".to_string(),
            email_from: "VenuePass <noreply@venuepass.app>".to_string(),
            app_name: "VenuePass".to_string(),
            support_email: "support@venuepass.app".to_string(),
            dashboard_url: "http://localhost:3000".to_string(),
        };
        assert!(config.is_enabled());
    }
}
