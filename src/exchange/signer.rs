//! API credentials and HMAC-SHA256 request signing

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Exchange API credentials
///
/// The secret is held in a `SecretString`, so it never shows up in `Debug`
/// output and its memory is zeroed when the credentials are dropped.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: SecretString,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: SecretString::from(api_secret.into()),
        }
    }

    pub fn from_secret(api_key: impl Into<String>, api_secret: SecretString) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret,
        }
    }

    /// Load credentials from the named environment variables (`.env` honoured)
    pub fn from_env(key_var: &str, secret_var: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let api_key = std::env::var(key_var)
            .map_err(|_| Error::InvalidConfiguration(format!("{key_var} is not set")))?;
        let api_secret = std::env::var(secret_var)
            .map_err(|_| Error::InvalidConfiguration(format!("{secret_var} is not set")))?;

        Ok(Self::new(api_key, api_secret))
    }

    /// Public API key, safe to log and send in headers
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Sign a canonical query with this secret
    pub fn sign(&self, canonical: &str) -> Result<String> {
        sign_request(&self.api_secret, canonical)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// HMAC-SHA256 of `canonical` keyed by `secret`, lowercase hex
///
/// The input must be the exact byte string sent on the wire; parameter order
/// matters.
pub fn sign_request(secret: &SecretString, canonical: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| Error::Authentication(format!("unusable signing key: {e}")))?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Ordered query parameters
///
/// Parameters are encoded in insertion order and the encoded string is both
/// what gets signed and what goes on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalQuery {
    params: Vec<(String, String)>,
}

impl CanonicalQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn param_opt(self, key: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_urlencoded::to_string(&self.params)
            .map_err(|e| Error::Protocol(format!("cannot encode query: {e}")))
    }

    /// Append `timestamp` and a signature over the whole query
    ///
    /// The timestamp is taken by the caller immediately before this call.
    pub fn sign(self, credentials: &Credentials, timestamp_ms: i64) -> Result<String> {
        let canonical = self.param("timestamp", timestamp_ms).encode()?;
        let signature = credentials.sign(&canonical)?;
        Ok(format!("{canonical}&signature={signature}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC_SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
    const DOC_QUERY: &str = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

    #[test]
    fn test_sign_known_vector() {
        let secret = SecretString::from(DOC_SECRET.to_string());
        assert_eq!(
            sign_request(&secret, DOC_QUERY).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let secret = SecretString::from("secret".to_string());
        let a = sign_request(&secret, DOC_QUERY).unwrap();
        let b = sign_request(&secret, DOC_QUERY).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_any_single_byte_change_alters_signature() {
        let secret = SecretString::from(DOC_SECRET.to_string());
        let reference = sign_request(&secret, DOC_QUERY).unwrap();

        for i in 0..DOC_QUERY.len() {
            let mut bytes = DOC_QUERY.as_bytes().to_vec();
            bytes[i] = if bytes[i] == b'x' { b'y' } else { b'x' };
            let altered = String::from_utf8(bytes).unwrap();
            assert_ne!(sign_request(&secret, &altered).unwrap(), reference, "byte {i}");
        }
    }

    #[test]
    fn test_canonical_query_keeps_order() {
        let query = CanonicalQuery::new()
            .param("symbol", "LTCBTC")
            .param("side", "BUY")
            .param("type", "LIMIT")
            .param("timeInForce", "GTC")
            .param("quantity", 1)
            .param("price", 0.1)
            .param("recvWindow", 5000)
            .param("timestamp", 1499827319559i64);
        assert_eq!(query.encode().unwrap(), DOC_QUERY);
    }

    #[test]
    fn test_signed_query_matches_signature_over_wire_bytes() {
        let credentials = Credentials::new("key", DOC_SECRET);
        let signed = CanonicalQuery::new()
            .param("symbol", "LTCBTC")
            .param("side", "BUY")
            .param("type", "LIMIT")
            .param("timeInForce", "GTC")
            .param("quantity", 1)
            .param("price", 0.1)
            .param("recvWindow", 5000)
            .sign(&credentials, 1499827319559)
            .unwrap();
        assert_eq!(
            signed,
            format!("{DOC_QUERY}&signature=c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71")
        );
    }

    #[test]
    fn test_values_are_percent_encoded() {
        let query = CanonicalQuery::new()
            .param("newClientOrderId", "a b&c")
            .param_opt("price", None::<f64>);
        assert_eq!(query.encode().unwrap(), "newClientOrderId=a+b%26c");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credentials = Credentials::new("public-key", "super-secret-value");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("public-key"));
        assert!(!debug.contains("super-secret-value"));
        assert!(debug.contains("[REDACTED]"));
    }
}
