//! Ephemeral media delivery engine.
//!
//! Resolves an asset to either a cached remote object or a fresh upload,
//! sends it with a self-destruct TTL, and retries exactly once when the
//! protocol reports the cached file reference expired. The [`Courier`]
//! facade wires session, authentication, verification, and delivery into
//! the surface a bot host consumes.

pub mod asset;
pub mod cache;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod service;
#[cfg(test)]
mod testutil;

pub use {
    asset::{MediaAsset, MediaSource},
    cache::{CachedMediaHandle, MediaHandleCache},
    engine::{DeliveryEngine, DeliveryOutcome},
    error::{Error, Result},
    fetch::{FileFetcher, NoRemoteFiles},
    service::Courier,
};
