use async_trait::async_trait;
use base64::Engine;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SignError};

pub const STAMP_HEADER_NAME: &str = "X-Stamp";
pub const SIGNATURE_SCHEME: &str = "SIGNATURE_SCHEME_TK_API_P256";

const PRIVATE_KEY_LEN: usize = 32;

const B64URL: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Authentication stamp attached to one request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stamp {
    pub header_name: String,
    pub header_value: String,
}

/// Decoded contents of a stamp header value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StampPayload {
    pub public_key: String,
    pub scheme: String,
    pub signature: String,
}

/// Anything that can authenticate a request body.
#[async_trait]
pub trait Stamper: Send + Sync {
    async fn stamp(&self, body: &[u8]) -> Result<Stamp>;
}

/// Stamps with a P-256 API key held in memory.
#[derive(Clone)]
pub struct ApiKeyStamper {
    public_key_hex: String,
    signing: SigningKey,
}

impl std::fmt::Debug for ApiKeyStamper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyStamper")
            .field("public_key_hex", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

impl ApiKeyStamper {
    /// Build from hex key material.
    ///
    /// The public key must be the compressed SEC1 encoding of the key derived
    /// from `private_key_hex`.
    pub fn new(public_key_hex: &str, private_key_hex: &str) -> Result<Self> {
        let private = hex::decode(private_key_hex.trim())
            .map_err(|err| SignError::configuration(format!("API private key is not hex: {err}")))?;
        let stamper = Self::from_private_key_bytes(&private)?;
        let expected = public_key_hex.trim().to_ascii_lowercase();
        if expected != stamper.public_key_hex {
            return Err(SignError::configuration(format!(
                "API public key '{}' does not match the private key (derived '{}')",
                public_key_hex.trim(),
                stamper.public_key_hex
            )));
        }
        Ok(stamper)
    }

    /// Build from a raw 32-byte private scalar, deriving the public key.
    pub fn from_private_key_bytes(private_key: &[u8]) -> Result<Self> {
        // `SigningKey::from_slice` left-pads short inputs; API keys are always 32 bytes.
        if private_key.len() != PRIVATE_KEY_LEN {
            return Err(SignError::configuration(format!(
                "invalid P-256 private key: expected {PRIVATE_KEY_LEN} bytes, got {}",
                private_key.len()
            )));
        }
        let signing = SigningKey::from_slice(private_key).map_err(|err| {
            SignError::configuration(format!("invalid P-256 private key: {err}"))
        })?;
        let public_key_hex = compressed_public_hex(signing.verifying_key());
        Ok(Self {
            public_key_hex,
            signing,
        })
    }

    /// Fresh random key pair.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let public_key_hex = compressed_public_hex(signing.verifying_key());
        Self {
            public_key_hex,
            signing,
        }
    }

    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Synchronous stamp; the async trait method delegates here.
    pub fn stamp_now(&self, body: &[u8]) -> Result<Stamp> {
        let signature: Signature = self.signing.sign(body);
        let payload = StampPayload {
            public_key: self.public_key_hex.clone(),
            scheme: SIGNATURE_SCHEME.to_string(),
            signature: hex::encode(signature.to_der().as_bytes()),
        };
        let json = serde_json::to_vec(&payload)
            .map_err(|err| SignError::configuration(format!("failed to encode stamp: {err}")))?;
        Ok(Stamp {
            header_name: STAMP_HEADER_NAME.to_string(),
            header_value: B64URL.encode(json),
        })
    }
}

#[async_trait]
impl Stamper for ApiKeyStamper {
    async fn stamp(&self, body: &[u8]) -> Result<Stamp> {
        self.stamp_now(body)
    }
}

fn compressed_public_hex(key: &VerifyingKey) -> String {
    hex::encode(key.to_encoded_point(true).as_bytes())
}

/// Decode a stamp header value without checking the signature.
pub fn decode_stamp(header_value: &str) -> Result<StampPayload> {
    let json = B64URL
        .decode(header_value.trim().as_bytes())
        .map_err(|err| SignError::configuration(format!("stamp is not base64url: {err}")))?;
    serde_json::from_slice(&json)
        .map_err(|err| SignError::configuration(format!("stamp is not valid JSON: {err}")))
}

/// Check that `header_value` is a valid stamp over exactly `body`.
///
/// Returns the public key that produced it.
pub fn verify_stamp(body: &[u8], header_value: &str) -> Result<String> {
    let payload = decode_stamp(header_value)?;
    if payload.scheme != SIGNATURE_SCHEME {
        return Err(SignError::configuration(format!(
            "unsupported stamp scheme '{}' (expected {SIGNATURE_SCHEME})",
            payload.scheme
        )));
    }
    let public = hex::decode(&payload.public_key)
        .map_err(|err| SignError::configuration(format!("stamp public key is not hex: {err}")))?;
    let verifying = VerifyingKey::from_sec1_bytes(&public)
        .map_err(|err| SignError::configuration(format!("invalid stamp public key: {err}")))?;
    let sig_der = hex::decode(&payload.signature)
        .map_err(|err| SignError::configuration(format!("stamp signature is not hex: {err}")))?;
    let signature = Signature::from_der(&sig_der)
        .map_err(|err| SignError::configuration(format!("invalid stamp signature: {err}")))?;
    verifying
        .verify(body, &signature)
        .map_err(|err| SignError::configuration(format!("stamp verification failed: {err}")))?;
    Ok(payload.public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Private scalar 1; its public key is the P-256 generator.
    const ONE_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const GENERATOR_COMPRESSED: &str =
        "036b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296";

    #[test]
    fn derives_compressed_public_key() {
        let stamper = ApiKeyStamper::new(GENERATOR_COMPRESSED, ONE_HEX).expect("stamper");
        assert_eq!(stamper.public_key_hex(), GENERATOR_COMPRESSED);
    }

    #[test]
    fn accepts_uppercase_public_key() {
        let upper = GENERATOR_COMPRESSED.to_ascii_uppercase();
        ApiKeyStamper::new(&upper, ONE_HEX).expect("case-insensitive match");
    }

    #[test]
    fn rejects_mismatched_public_key() {
        let other = ApiKeyStamper::generate();
        let err = ApiKeyStamper::new(other.public_key_hex(), ONE_HEX).unwrap_err();
        assert!(matches!(err, SignError::Configuration(_)), "{err}");
        assert!(err.to_string().contains("does not match"), "{err}");
    }

    #[test]
    fn rejects_malformed_private_key() {
        let err = ApiKeyStamper::new(GENERATOR_COMPRESSED, "zz").unwrap_err();
        assert!(err.to_string().contains("not hex"), "{err}");

        let err = ApiKeyStamper::new(GENERATOR_COMPRESSED, "00").unwrap_err();
        assert!(err.to_string().contains("invalid P-256 private key"), "{err}");

        let short = "11".repeat(31);
        let err = ApiKeyStamper::new(GENERATOR_COMPRESSED, &short).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"), "{err}");
    }

    #[test]
    fn stamp_payload_has_expected_shape() {
        let stamper = ApiKeyStamper::generate();
        let stamp = stamper.stamp_now(b"{\"a\":1}").expect("stamp");
        assert_eq!(stamp.header_name, STAMP_HEADER_NAME);
        assert!(!stamp.header_value.contains('='), "no padding expected");

        let payload = decode_stamp(&stamp.header_value).expect("decode");
        assert_eq!(payload.public_key, stamper.public_key_hex());
        assert_eq!(payload.scheme, SIGNATURE_SCHEME);
        // DER ECDSA signatures start with a SEQUENCE tag.
        assert!(payload.signature.starts_with("30"), "{}", payload.signature);
    }

    #[test]
    fn stamp_verifies_only_for_the_stamped_body() {
        let stamper = ApiKeyStamper::generate();
        let stamp = stamper.stamp_now(b"body-one").expect("stamp");
        let key = verify_stamp(b"body-one", &stamp.header_value).expect("verify");
        assert_eq!(key, stamper.public_key_hex());

        let err = verify_stamp(b"body-two", &stamp.header_value).unwrap_err();
        assert!(err.to_string().contains("verification failed"), "{err}");
    }

    #[test]
    fn private_key_hex_round_trips() {
        let stamper = ApiKeyStamper::generate();
        let again = ApiKeyStamper::new(stamper.public_key_hex(), &stamper.private_key_hex())
            .expect("rebuild");
        assert_eq!(again.public_key_hex(), stamper.public_key_hex());
    }
}
