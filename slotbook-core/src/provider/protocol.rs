//! JSON protocol spoken with provider binaries over stdin/stdout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::calendar::{CreatedEvent, EventInstance, EventSpec, Exclusions};
use crate::notify::Notification;
use crate::payment::Refund;

type Params = serde_json::Map<String, serde_json::Value>;

pub trait ProviderCommand: Serialize {
    type Response: DeserializeOwned;
    fn command() -> Command;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    CreateEvent,
    CancelEvent,
    DeleteEvent,
    PatchRecurrence,
    ListInstances,
    RescheduleEvent,
    CreateSession,
    CancelSessions,
    IssueRefund,
    SendNotification,
}

/// Request sent to a provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Response read back from a provider.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response<T> {
    Success { data: T },
    Error { error: String },
}

// ============================================================================
// Calendar
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEvent {
    #[serde(flatten)]
    pub params: Params,
    pub event: EventSpec,
}

impl ProviderCommand for CreateEvent {
    type Response = CreatedEvent;
    fn command() -> Command {
        Command::CreateEvent
    }
}

/// Cancel an event and notify its attendees.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelEvent {
    #[serde(flatten)]
    pub params: Params,
    pub event_id: String,
}

impl ProviderCommand for CancelEvent {
    type Response = ();
    fn command() -> Command {
        Command::CancelEvent
    }
}

/// Remove an event without notifying anyone.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteEvent {
    #[serde(flatten)]
    pub params: Params,
    pub event_id: String,
}

impl ProviderCommand for DeleteEvent {
    type Response = ();
    fn command() -> Command {
        Command::DeleteEvent
    }
}

/// Replace the recurrence (RRULE + EXDATE lines) of a master event.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchRecurrence {
    #[serde(flatten)]
    pub params: Params,
    pub event_id: String,
    pub exclusions: Exclusions,
}

impl ProviderCommand for PatchRecurrence {
    type Response = ();
    fn command() -> Command {
        Command::PatchRecurrence
    }
}

/// Expanded instances of a recurring event within `[from, to]`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListInstances {
    #[serde(flatten)]
    pub params: Params,
    pub event_id: String,
    pub from: String,
    pub to: String,
}

impl ProviderCommand for ListInstances {
    type Response = Vec<EventInstance>;
    fn command() -> Command {
        Command::ListInstances
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RescheduleEvent {
    #[serde(flatten)]
    pub params: Params,
    pub event_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ProviderCommand for RescheduleEvent {
    type Response = ();
    fn command() -> Command {
        Command::RescheduleEvent
    }
}

// ============================================================================
// Payments
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSession {
    #[serde(flatten)]
    pub params: Params,
    pub booking_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub payer_email: String,
}

impl ProviderCommand for CreateSession {
    type Response = String; // Checkout URL
    fn command() -> Command {
        Command::CreateSession
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelSessions {
    #[serde(flatten)]
    pub params: Params,
    pub booking_id: String,
}

impl ProviderCommand for CancelSessions {
    type Response = ();
    fn command() -> Command {
        Command::CancelSessions
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssueRefund {
    #[serde(flatten)]
    pub params: Params,
    pub booking_id: String,
    pub reason: String,
}

impl ProviderCommand for IssueRefund {
    type Response = Refund;
    fn command() -> Command {
        Command::IssueRefund
    }
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SendNotification {
    #[serde(flatten)]
    pub params: Params,
    pub notification: Notification,
}

impl ProviderCommand for SendNotification {
    type Response = ();
    fn command() -> Command {
        Command::SendNotification
    }
}
