//! Client-facing emails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::booking::Money;
use crate::error::BookingResult;
use crate::provider::ProviderConfig;
use crate::provider::protocol::SendNotification;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    PaymentRequest {
        booking_id: String,
        to: String,
        amount: Money,
        session_url: String,
        start: DateTime<Utc>,
    },
    Cancellation {
        booking_id: String,
        to: String,
        start: DateTime<Utc>,
        /// Amount being refunded, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refund: Option<Money>,
    },
}

impl Notification {
    pub fn booking_id(&self) -> &str {
        match self {
            Notification::PaymentRequest { booking_id, .. }
            | Notification::Cancellation { booking_id, .. } => booking_id,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> BookingResult<()>;
}

pub struct ProviderNotifier {
    config: ProviderConfig,
}

impl ProviderNotifier {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Notifier for ProviderNotifier {
    async fn send(&self, notification: &Notification) -> BookingResult<()> {
        self.config
            .provider
            .call(SendNotification {
                params: self.config.params.clone(),
                notification: notification.clone(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_is_tagged_by_kind() {
        let n = Notification::Cancellation {
            booking_id: "b-1".into(),
            to: "client@example.com".into(),
            start: Utc::now(),
            refund: Some(Money::new(8000, "EUR")),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["kind"], "cancellation");
        assert_eq!(json["refund"]["amount_minor"], 8000);
        assert_eq!(n.booking_id(), "b-1");
    }
}
