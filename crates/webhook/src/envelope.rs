//! Outbound envelopes: a compact HS256 token plus a hex HMAC of the token.
//!
//! The token is a standard three-part JWT (`header.claims.signature`, all
//! base64url without padding) so subscribers can decode it with any JWT
//! library. `iat` and `exp` are NumericDate seconds.

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    hmac::Mac,
    parley_common::{Error, Result},
    serde::{Deserialize, Serialize},
    tracing::debug,
};

use crate::auth::{WebhookAuthenticator, mac};

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeClaims {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub iat: u64,
    pub exp: u64,
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub token: String,
    /// Hex HMAC-SHA256 of `token`.
    pub signature: String,
}

impl WebhookAuthenticator {
    pub fn seal(&self, event: &str, data: serde_json::Value, now_ms: u64) -> Result<SealedEnvelope> {
        let iat = now_ms / 1_000;
        let claims = EnvelopeClaims {
            event: event.to_string(),
            data,
            iat,
            exp: iat + self.envelope_ttl_ms.div_ceil(1_000),
        };
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let mut m = mac(self.secret_bytes())?;
        m.update(signing_input.as_bytes());
        let token = format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(m.finalize().into_bytes())
        );
        let signature = self.sign(token.as_bytes())?;
        Ok(SealedEnvelope { token, signature })
    }

    /// Verify both signature layers and the expiry, then return the claims.
    pub fn open_envelope(&self, token: &str, signature: &str, now_ms: u64) -> Result<EnvelopeClaims> {
        if !self.verify(token.as_bytes(), signature) {
            return Err(Error::authentication("envelope signature mismatch"));
        }

        let malformed = || Error::authentication("malformed envelope token");
        let (signing_input, sig) = token.rsplit_once('.').ok_or_else(malformed)?;
        let (header, body) = signing_input.split_once('.').ok_or_else(malformed)?;
        if body.contains('.') {
            return Err(malformed());
        }

        let header: serde_json::Value = decode_segment(header)?;
        if header.get("alg").and_then(serde_json::Value::as_str) != Some("HS256") {
            return Err(Error::authentication("unsupported envelope algorithm"));
        }

        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| malformed())?;
        let mut m = mac(self.secret_bytes())?;
        m.update(signing_input.as_bytes());
        m.verify_slice(&sig)
            .map_err(|_| Error::authentication("envelope token signature mismatch"))?;

        let claims: EnvelopeClaims = decode_segment(body)?;
        if now_ms / 1_000 >= claims.exp {
            debug!(event = %claims.event, exp = claims.exp, "expired envelope");
            return Err(Error::authentication("envelope expired"));
        }
        Ok(claims)
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| Error::authentication("malformed envelope token"))?;
    Ok(serde_json::from_slice(&bytes)?)
}
