use subtle::ConstantTimeEq;

/// Process-wide shared secret, fixed at startup.
///
/// An unset (or empty) secret rejects every credential, including an empty
/// one.
pub struct Credential {
    expected: Option<Vec<u8>>,
}

impl Credential {
    pub fn new(secret: Option<&str>) -> Self {
        let expected = secret
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec());
        if expected.is_none() {
            tracing::warn!("API key is not configured; every request will be rejected");
        }
        Self { expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    /// Constant-time comparison against the configured secret.
    pub fn verify(&self, supplied: Option<&str>) -> bool {
        match (&self.expected, supplied) {
            (Some(expected), Some(supplied)) if !supplied.is_empty() => {
                expected.as_slice().ct_eq(supplied.as_bytes()).into()
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("configured", &self.is_configured())
            .finish()
    }
}
