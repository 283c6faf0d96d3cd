//! Core of the slotbook booking service.
//!
//! This crate keeps three systems of record aligned:
//! - the booking ledger (`store`)
//! - the external calendar (`calendar`)
//! - the payment processor (`payment`)
//!
//! `orchestrator` drives create, cancel, reschedule and payment flows across
//! them. `recurrence`, `exceptions` and `scheduler` implement recurring series.

pub mod booking;
pub mod calendar;
pub mod error;
pub mod exceptions;
pub mod ics;
pub mod notify;
pub mod orchestrator;
pub mod payment;
pub mod provider;
pub mod recurrence;
pub mod scheduler;
pub mod settings;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{BookingError, BookingResult, ErrorKind};
