use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Configuration;

pub const ACTIVITY_TYPE_SIGN_RAW_PAYLOAD: &str = "ACTIVITY_TYPE_SIGN_RAW_PAYLOAD_V2";
pub const PAYLOAD_ENCODING_TEXT_UTF8: &str = "PAYLOAD_ENCODING_TEXT_UTF8";
pub const HASH_FUNCTION_SHA256: &str = "HASH_FUNCTION_SHA256";

pub const PAYLOAD_LEN: usize = 20;
pub const PAYLOAD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Body of one "sign raw payload" activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRawPayloadRequest {
    #[serde(rename = "type")]
    pub activity_type: String,
    pub timestamp_ms: String,
    pub organization_id: String,
    pub parameters: SignRawPayloadParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRawPayloadParameters {
    pub sign_with: String,
    pub payload: String,
    pub encoding: String,
    pub hash_function: String,
}

impl SignRawPayloadRequest {
    /// Build a request with its own random payload, stamped with the current time.
    pub fn build<R: Rng + ?Sized>(config: &Configuration, rng: &mut R) -> Self {
        Self {
            activity_type: ACTIVITY_TYPE_SIGN_RAW_PAYLOAD.to_string(),
            timestamp_ms: now_ms().to_string(),
            organization_id: config.organization_id.clone(),
            parameters: SignRawPayloadParameters {
                sign_with: config.sign_with.clone(),
                payload: random_payload(rng, PAYLOAD_LEN),
                encoding: PAYLOAD_ENCODING_TEXT_UTF8.to_string(),
                hash_function: HASH_FUNCTION_SHA256.to_string(),
            },
        }
    }
}

/// Random string over [`PAYLOAD_ALPHABET`]. Demo traffic, not a secret.
pub fn random_payload<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| PAYLOAD_ALPHABET[rng.gen_range(0..PAYLOAD_ALPHABET.len())] as char)
        .collect()
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
