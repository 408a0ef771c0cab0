//! Contact verification for ephemeral media sends.
//!
//! The protocol only permits self-destructing media between mutual
//! contacts. This crate checks the relationship, attempts one automatic
//! remediation, and classifies what is left for the recipient or an admin
//! to do.

pub mod error;
pub mod record;
pub mod store;
pub mod verify;

pub use {
    error::{Error, Result},
    record::ContactVerificationRecord,
    store::{ContactRecordStore, MemoryContactStore},
    verify::{ContactOutcome, ContactVerifier},
};
