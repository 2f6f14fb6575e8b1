//! Operator verification challenges.
//!
//! On first contact both sides display the same 3-digit code and each operator
//! confirms it out of band. The code is derived from both certificate
//! fingerprints, so the value being compared is bound to the credentials the
//! TLS channel actually presented.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// How long a challenge stays answerable.
pub const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);

/// Derive the shared 3-digit verification code from two certificate
/// fingerprints. Order-independent: both sides compute the same code.
#[must_use]
pub fn derive_code(fingerprint_a: &str, fingerprint_b: &str) -> String {
    let (lo, hi) = if fingerprint_a <= fingerprint_b {
        (fingerprint_a, fingerprint_b)
    } else {
        (fingerprint_b, fingerprint_a)
    };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    let code = 100 + (u64::from_be_bytes(word) % 900);
    code.to_string()
}

/// A live verification challenge for one device.
#[derive(Debug, Clone)]
pub struct VerificationChallenge {
    /// Device awaiting operator confirmation
    pub device_id: String,
    /// 3-digit code both operators compare
    pub code: String,
    /// Monotonic deadline after which the challenge is inert
    pub expires_at: Instant,
}

impl VerificationChallenge {
    /// Whether the challenge is still answerable.
    #[must_use]
    pub fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// All live challenges, at most one per device.
#[derive(Default)]
pub struct ChallengeBook {
    live: Mutex<HashMap<String, VerificationChallenge>>,
    ttl: Option<Duration>,
}

impl ChallengeBook {
    /// Create an empty book with the default TTL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }

    /// Issue a challenge for a device, replacing any existing one.
    pub fn issue(&self, device_id: &str, code: &str) -> VerificationChallenge {
        let challenge = VerificationChallenge {
            device_id: device_id.to_string(),
            code: code.to_string(),
            expires_at: Instant::now() + self.ttl.unwrap_or(CHALLENGE_TTL),
        };
        self.live
            .lock()
            .expect("challenge book lock poisoned")
            .insert(device_id.to_string(), challenge.clone());
        challenge
    }

    /// Remove and return the live challenge for a device. Expired challenges
    /// are purged and `None` is returned, so a stale accept can never pin.
    pub fn take_live(&self, device_id: &str) -> Option<VerificationChallenge> {
        let mut live = self.live.lock().expect("challenge book lock poisoned");
        match live.remove(device_id) {
            Some(challenge) if challenge.is_live() => Some(challenge),
            Some(_) => {
                tracing::debug!("discarding expired challenge for {device_id}");
                None
            }
            None => None,
        }
    }

    /// Peek at the live challenge for a device without consuming it.
    #[must_use]
    pub fn get_live(&self, device_id: &str) -> Option<VerificationChallenge> {
        let mut live = self.live.lock().expect("challenge book lock poisoned");
        match live.get(device_id) {
            Some(challenge) if challenge.is_live() => Some(challenge.clone()),
            Some(_) => {
                live.remove(device_id);
                None
            }
            None => None,
        }
    }

    /// Drop every expired challenge.
    pub fn purge_expired(&self) {
        self.live
            .lock()
            .expect("challenge book lock poisoned")
            .retain(|_, challenge| challenge.is_live());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_code_is_three_digits_and_symmetric() {
        let a = "aa11";
        let b = "bb22";
        let code = derive_code(a, b);
        assert_eq!(code.len(), 3);
        let n: u32 = code.parse().unwrap();
        assert!((100..=999).contains(&n));
        assert_eq!(code, derive_code(b, a));
    }

    #[test]
    fn different_fingerprints_usually_differ() {
        let base = derive_code("fp-one", "fp-two");
        let other = derive_code("fp-one", "fp-three");
        // Not guaranteed distinct for every pair, but these known inputs are.
        assert_ne!(base, other);
    }

    #[test]
    fn one_live_challenge_per_device() {
        let book = ChallengeBook::new();
        book.issue("dev", "111");
        book.issue("dev", "222");

        let challenge = book.take_live("dev").unwrap();
        assert_eq!(challenge.code, "222");
        assert!(book.take_live("dev").is_none());
    }

    #[test]
    fn expired_challenges_are_inert() {
        let book = ChallengeBook::with_ttl(Duration::from_millis(0));
        book.issue("dev", "123");
        std::thread::sleep(Duration::from_millis(5));
        assert!(book.take_live("dev").is_none());
    }

    #[test]
    fn purge_drops_only_expired() {
        let expiring = ChallengeBook::with_ttl(Duration::from_millis(0));
        expiring.issue("old", "100");
        std::thread::sleep(Duration::from_millis(5));
        expiring.purge_expired();
        assert!(expiring.get_live("old").is_none());

        let fresh = ChallengeBook::new();
        fresh.issue("new", "200");
        fresh.purge_expired();
        assert!(fresh.get_live("new").is_some());
    }
}
