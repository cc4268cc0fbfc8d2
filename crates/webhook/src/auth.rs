use {
    hmac::{Hmac, Mac},
    parley_common::{Error, Result},
    parley_config::WebhookConfig,
    reqwest::header::HeaderMap,
    secrecy::{ExposeSecret, Secret},
    sha2::Sha256,
    subtle::ConstantTimeEq,
    tracing::{debug, warn},
};

pub(crate) type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Hex-encoded SHA-256 output length.
const SIGNATURE_LEN: usize = 64;

pub(crate) fn mac(secret: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|e| Error::authentication(format!("invalid signing key: {e}")))
}

/// Lowercase hex HMAC-SHA256 of `payload`.
pub fn sign(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut m = mac(secret)?;
    m.update(payload);
    Ok(hex::encode(m.finalize().into_bytes()))
}

/// Check `signature` against the HMAC of `payload`.
///
/// A signature of the wrong length is rejected before the constant-time
/// comparison. Every valid signature is exactly 64 characters, so the early
/// return reveals nothing about the secret.
pub fn verify(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let signature = signature.trim();
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let Ok(expected) = sign(secret, payload) else {
        return false;
    };
    expected
        .as_bytes()
        .ct_eq(signature.to_ascii_lowercase().as_bytes())
        .into()
}

/// Verifies inbound webhook requests and seals outbound envelopes with one
/// shared secret.
pub struct WebhookAuthenticator {
    secret: Secret<String>,
    tolerance_ms: u64,
    require_timestamp: bool,
    pub(crate) envelope_ttl_ms: u64,
}

impl WebhookAuthenticator {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            tolerance_ms: config.timeout_ms,
            require_timestamp: config.require_timestamp,
            envelope_ttl_ms: config.envelope_ttl_ms,
        }
    }

    pub(crate) fn secret_bytes(&self) -> &[u8] {
        self.secret.expose_secret().as_bytes()
    }

    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        sign(self.secret_bytes(), payload)
    }

    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        verify(self.secret_bytes(), payload, signature)
    }

    /// Authenticate a raw webhook request.
    ///
    /// Replays inside the tolerance window are accepted; there is no record
    /// of consumed signatures.
    pub fn verify_request(&self, headers: &HeaderMap, body: &[u8], now_ms: u64) -> Result<()> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::authentication("missing signature header"))?;

        match headers.get(TIMESTAMP_HEADER) {
            Some(raw) => {
                let ts = raw
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .ok_or_else(|| Error::authentication("malformed timestamp header"))?;
                self.check_timestamp(ts, now_ms)?;
            },
            None if self.require_timestamp => {
                return Err(Error::authentication("missing timestamp header"));
            },
            None => {},
        }

        if !self.verify(body, signature) {
            warn!("webhook signature mismatch");
            return Err(Error::authentication("invalid signature"));
        }
        debug!(bytes = body.len(), "webhook request verified");
        Ok(())
    }

    fn check_timestamp(&self, ts: u64, now_ms: u64) -> Result<()> {
        if now_ms.saturating_sub(ts) > self.tolerance_ms {
            return Err(Error::authentication("timestamp outside tolerance (too old)"));
        }
        if ts.saturating_sub(now_ms) > self.tolerance_ms {
            return Err(Error::authentication(
                "timestamp outside tolerance (in the future)",
            ));
        }
        Ok(())
    }
}
