//! Payment processor contract and its provider-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::booking::Money;
use crate::error::BookingResult;
use crate::provider::ProviderConfig;
use crate::provider::protocol::{CancelSessions, CreateSession, IssueRefund};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Succeeded,
    /// Accepted by the processor, settles later.
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub status: RefundStatus,
}

#[async_trait]
pub trait PaymentAdapter: Send + Sync {
    /// Open a checkout session and return its URL.
    async fn create_session(
        &self,
        booking_id: &str,
        amount: &Money,
        payer_email: &str,
    ) -> BookingResult<String>;

    async fn cancel_sessions_for_booking(&self, booking_id: &str) -> BookingResult<()>;

    async fn refund(&self, booking_id: &str, reason: &str) -> BookingResult<Refund>;
}

pub struct ProviderPayments {
    config: ProviderConfig,
}

impl ProviderPayments {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PaymentAdapter for ProviderPayments {
    async fn create_session(
        &self,
        booking_id: &str,
        amount: &Money,
        payer_email: &str,
    ) -> BookingResult<String> {
        self.config
            .provider
            .call(CreateSession {
                params: self.config.params.clone(),
                booking_id: booking_id.to_string(),
                amount_minor: amount.amount_minor,
                currency: amount.currency.clone(),
                payer_email: payer_email.to_string(),
            })
            .await
    }

    async fn cancel_sessions_for_booking(&self, booking_id: &str) -> BookingResult<()> {
        self.config
            .provider
            .call(CancelSessions {
                params: self.config.params.clone(),
                booking_id: booking_id.to_string(),
            })
            .await
    }

    async fn refund(&self, booking_id: &str, reason: &str) -> BookingResult<Refund> {
        self.config
            .provider
            .call(IssueRefund {
                params: self.config.params.clone(),
                booking_id: booking_id.to_string(),
                reason: reason.to_string(),
            })
            .await
    }
}
