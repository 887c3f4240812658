//! Admission control: credential, per-client rate and stream ownership.

mod credential;
mod rate_limit;

use std::sync::atomic::{AtomicU64, Ordering};

pub use credential::Credential;
pub use rate_limit::{RateLimiter, TokenBucket};

use relay_api::StreamId;

use crate::config::{AuthConfig, RateLimitConfig};

/// Why a request was refused at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("Unauthorized: invalid or missing API key")]
    Unauthorized,

    #[error("Forbidden: Access to this stream is restricted")]
    Forbidden,

    #[error("Too many requests")]
    TooManyRequests,
}

/// Snapshot of the gate's denial counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DenialCounts {
    pub unauthorized: u64,
    pub forbidden: u64,
    pub too_many_requests: u64,
}

impl DenialCounts {
    pub fn total(&self) -> u64 {
        self.unauthorized + self.forbidden + self.too_many_requests
    }
}

#[derive(Debug, Default)]
struct Counters {
    unauthorized: AtomicU64,
    forbidden: AtomicU64,
    too_many_requests: AtomicU64,
}

#[derive(Debug)]
pub struct Gate {
    credential: Credential,
    limiter: RateLimiter,
    counters: Counters,
}

impl Gate {
    pub fn new(auth: &AuthConfig, rate: &RateLimitConfig) -> Self {
        Self {
            credential: Credential::new(auth.api_key.as_deref()),
            limiter: RateLimiter::new(rate),
            counters: Counters::default(),
        }
    }

    /// Credential check, then one token from `client`'s bucket.
    ///
    /// A request that fails the credential check does not spend a token.
    pub fn authorize(&self, credential: Option<&str>, client: &str) -> Result<(), Denial> {
        self.verify_credential(credential, client)?;
        self.check_rate(client)
    }

    pub fn verify_credential(&self, credential: Option<&str>, client: &str) -> Result<(), Denial> {
        if self.credential.verify(credential) {
            Ok(())
        } else {
            Err(self.reject(Denial::Unauthorized, client))
        }
    }

    pub fn check_rate(&self, client: &str) -> Result<(), Denial> {
        if self.limiter.check(client) {
            Ok(())
        } else {
            Err(self.reject(Denial::TooManyRequests, client))
        }
    }

    /// Exact match between the stream in the path and the one the client
    /// declared. A missing declaration is a mismatch.
    pub fn check_ownership(&self, stream: &StreamId, declared: Option<&str>) -> Result<(), Denial> {
        match declared {
            Some(declared) if declared == stream.as_str() => Ok(()),
            _ => {
                let denial = Denial::Forbidden;
                self.count(denial);
                tracing::warn!(
                    stream = %stream,
                    declared = declared.unwrap_or("<none>"),
                    "request denied: {denial}"
                );
                Err(denial)
            }
        }
    }

    pub fn denials(&self) -> DenialCounts {
        DenialCounts {
            unauthorized: self.counters.unauthorized.load(Ordering::Relaxed),
            forbidden: self.counters.forbidden.load(Ordering::Relaxed),
            too_many_requests: self.counters.too_many_requests.load(Ordering::Relaxed),
        }
    }

    /// Count and log a denial decided outside the gate's own checks.
    pub fn reject(&self, denial: Denial, client: &str) -> Denial {
        self.count(denial);
        tracing::warn!(client, "request denied: {denial}");
        denial
    }

    fn count(&self, denial: Denial) {
        let counter = match denial {
            Denial::Unauthorized => &self.counters.unauthorized,
            Denial::Forbidden => &self.counters.forbidden,
            Denial::TooManyRequests => &self.counters.too_many_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
