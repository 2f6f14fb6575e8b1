//! # Airlift Trust
//!
//! Trust-on-first-use certificate handling for Airlift.
//!
//! This crate provides:
//! - The local self-signed TLS identity (generated once, persisted as DER)
//! - The TOFU trust store pinning peer certificate fingerprints
//! - Operator verification challenges with short human-comparable codes
//!
//! Transport-level certificate validation is intentionally disabled elsewhere;
//! everything here exists so the application layer can make the trust decision
//! instead.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod challenge;
pub mod identity;
pub mod store;

pub use challenge::{CHALLENGE_TTL, ChallengeBook, VerificationChallenge, derive_code};
pub use identity::{DeviceIdentity, fingerprint_hex};
pub use store::{TrustError, TrustRecord, TrustStore, VerifyOutcome};
