use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SignError};
use crate::request::SignRawPayloadRequest;
use crate::stamper::{Stamp, Stamper};

pub const DEFAULT_BASE_URL: &str = "https://api.turnkey.com";
pub const WHOAMI_PATH: &str = "/public/v1/query/whoami";
pub const SIGN_RAW_PAYLOAD_PATH: &str = "/public/v1/submit/sign_raw_payload";
pub const ACTIVITY_STATUS_COMPLETED: &str = "ACTIVITY_STATUS_COMPLETED";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhoamiRequest {
    pub organization_id: String,
}

/// Identity behind the credential, as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Whoami {
    pub organization_id: String,
    #[serde(default)]
    pub organization_name: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSignature {
    pub r: String,
    pub s: String,
    pub v: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign_raw_payload_result: Option<RawSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub status: String,
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActivityResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityResponse {
    pub activity: Activity,
}

impl ActivityResponse {
    pub fn signature(&self) -> Option<&RawSignature> {
        self.activity
            .result
            .as_ref()
            .and_then(|r| r.sign_raw_payload_result.as_ref())
    }
}

/// A request that has been serialized and stamped but not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedRequest {
    pub url: String,
    pub body: String,
    pub stamp: Stamp,
}

/// Remote key-management API as seen by the harness.
#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Identity check for the credential against `organization_id`.
    async fn whoami(&self, organization_id: &str) -> Result<Whoami>;

    /// Submit one signing activity and wait for its response.
    async fn sign_raw_payload(&self, request: &SignRawPayloadRequest) -> Result<ActivityResponse>;

    /// Serialize and stamp a signing activity without sending it.
    async fn stamp_sign_raw_payload(&self, request: &SignRawPayloadRequest)
        -> Result<StampedRequest>;
}

/// HTTPS client that stamps every body with the configured [`Stamper`].
#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    http: Client,
    stamper: Arc<dyn Stamper>,
}

impl HttpClient {
    pub fn new(base_url: &str, stamper: Arc<dyn Stamper>) -> Result<Self> {
        Self::with_timeout(base_url, stamper, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        stamper: Arc<dyn Stamper>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SignError::configuration(format!("failed to build http client: {err}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            stamper,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn stamp_body<T: Serialize>(&self, path: &str, body: &T) -> Result<StampedRequest> {
        let body = serde_json::to_string(body)
            .map_err(|err| SignError::configuration(format!("failed to encode request: {err}")))?;
        let stamp = self.stamper.stamp(body.as_bytes()).await?;
        Ok(StampedRequest {
            url: format!("{}{path}", self.base_url),
            body,
            stamp,
        })
    }

    async fn post<T: Serialize, R: DeserializeOwned>(&self, path: &str, body: &T) -> Result<R> {
        let stamped = self.stamp_body(path, body).await?;
        debug!(url = %stamped.url, "POST");

        let response = self
            .http
            .post(&stamped.url)
            .header("Content-Type", "application/json")
            .header(&stamped.stamp.header_name, &stamped.stamp.header_value)
            .body(stamped.body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SignError::remote(format!("REMOTE_TIMEOUT: {err}"))
                } else {
                    SignError::remote(format!("REMOTE_UNREACHABLE: {err}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let trimmed = text.trim();
            let trimmed = match trimmed.char_indices().nth(MAX_ERROR_BODY) {
                Some((idx, _)) => &trimmed[..idx],
                None => trimmed,
            };
            return Err(SignError::remote(format!(
                "REMOTE_BAD_STATUS: {status} from {path}: {trimmed}"
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| SignError::remote(format!("REMOTE_INVALID_JSON: {err}")))
    }
}

#[async_trait]
impl SigningClient for HttpClient {
    async fn whoami(&self, organization_id: &str) -> Result<Whoami> {
        let body = WhoamiRequest {
            organization_id: organization_id.to_string(),
        };
        self.post(WHOAMI_PATH, &body).await
    }

    async fn sign_raw_payload(&self, request: &SignRawPayloadRequest) -> Result<ActivityResponse> {
        let response: ActivityResponse = self.post(SIGN_RAW_PAYLOAD_PATH, request).await?;
        if response.activity.status != ACTIVITY_STATUS_COMPLETED {
            return Err(SignError::remote(format!(
                "activity {} finished with status {}",
                response.activity.id, response.activity.status
            )));
        }
        Ok(response)
    }

    async fn stamp_sign_raw_payload(
        &self,
        request: &SignRawPayloadRequest,
    ) -> Result<StampedRequest> {
        self.stamp_body(SIGN_RAW_PAYLOAD_PATH, request).await
    }
}
