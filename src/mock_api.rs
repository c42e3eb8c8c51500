//! Local stand-in for the signing API.
//!
//! Serves the two endpoints the harness uses, checks the `X-Stamp` header on
//! every request against the exact body bytes, and fakes signatures. Meant
//! for offline demos and integration tests, not for real key custody.

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, warn};

use crate::client::{
    Activity, ActivityResponse, ActivityResult, RawSignature, Whoami, WhoamiRequest,
    ACTIVITY_STATUS_COMPLETED, SIGN_RAW_PAYLOAD_PATH, WHOAMI_PATH,
};
use crate::request::{SignRawPayloadRequest, ACTIVITY_TYPE_SIGN_RAW_PAYLOAD};
use crate::stamper::{verify_stamp, STAMP_HEADER_NAME};

const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Behaviour switches and counters shared with the serving thread.
#[derive(Debug, Default)]
pub struct MockApiState {
    organizations: HashSet<String>,
    fail_signing: AtomicBool,
    sign_requests: AtomicUsize,
    whoami_requests: AtomicUsize,
}

impl MockApiState {
    /// Accept `whoami` for the listed organizations only. An empty list
    /// accepts any organization.
    pub fn new<I, S>(organizations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            organizations: organizations.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.fail_signing.store(fail, Ordering::SeqCst);
    }

    pub fn sign_requests(&self) -> usize {
        self.sign_requests.load(Ordering::SeqCst)
    }

    pub fn whoami_requests(&self) -> usize {
        self.whoami_requests.load(Ordering::SeqCst)
    }

    fn knows(&self, organization_id: &str) -> bool {
        self.organizations.is_empty() || self.organizations.contains(organization_id)
    }
}

/// A server bound to a local address, serving on a background thread.
pub struct MockApi {
    base_url: String,
    state: Arc<MockApiState>,
}

impl MockApi {
    /// Bind `bind_addr` and start serving. The socket is bound before this
    /// returns, so the base URL is immediately usable.
    pub fn start(bind_addr: &str, state: MockApiState) -> Result<Self> {
        let server = Server::http(bind_addr)
            .map_err(|err| anyhow!("failed to bind mock API at {bind_addr}: {err}"))?;
        let state = Arc::new(state);
        let serving = Arc::clone(&state);
        std::thread::spawn(move || {
            if let Err(err) = serve(server, &serving) {
                warn!("mock API stopped: {err:#}");
            }
        });
        Ok(Self {
            base_url: format!("http://{bind_addr}"),
            state,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn state(&self) -> &MockApiState {
        &self.state
    }
}

/// Serve on `bind_addr` on the current thread until the process exits.
pub fn run_server(bind_addr: &str, state: MockApiState) -> Result<()> {
    let server = Server::http(bind_addr)
        .map_err(|err| anyhow!("failed to bind mock API at {bind_addr}: {err}"))?;
    serve(server, &state)
}

fn serve(server: Server, state: &MockApiState) -> Result<()> {
    for mut request in server.incoming_requests() {
        let method = request.method().clone();
        let url = request.url().to_string();

        let body = match read_body(&mut request) {
            Ok(body) => body,
            Err(err) => {
                request.respond(error_response(413, &err.to_string()))?;
                continue;
            }
        };

        let response = match (method, url.as_str()) {
            (Method::Get, "/health") => json_response(200, json!({ "ok": true })),
            (Method::Post, WHOAMI_PATH) => {
                state.whoami_requests.fetch_add(1, Ordering::SeqCst);
                match check_stamp(&request, &body) {
                    Ok(()) => handle_whoami(state, &body),
                    Err(resp) => resp,
                }
            }
            (Method::Post, SIGN_RAW_PAYLOAD_PATH) => {
                state.sign_requests.fetch_add(1, Ordering::SeqCst);
                match check_stamp(&request, &body) {
                    Ok(()) => handle_sign(state, &body),
                    Err(resp) => resp,
                }
            }
            _ => Response::from_data(Vec::new()).with_status_code(404),
        };
        request.respond(response)?;
    }
    Ok(())
}

fn read_body(request: &mut Request) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take((MAX_REQUEST_BYTES + 1) as u64)
        .read_to_end(&mut body)
        .context("failed to read request body")?;
    if body.len() > MAX_REQUEST_BYTES {
        return Err(anyhow!("request payload exceeds {MAX_REQUEST_BYTES} bytes"));
    }
    Ok(body)
}

type HttpResponse = Response<std::io::Cursor<Vec<u8>>>;

fn check_stamp(request: &Request, body: &[u8]) -> std::result::Result<(), HttpResponse> {
    let stamp = request
        .headers()
        .iter()
        .find(|h| h.field.equiv(STAMP_HEADER_NAME))
        .map(|h| h.value.as_str().to_string());
    let Some(stamp) = stamp else {
        return Err(error_response(401, "missing X-Stamp header"));
    };
    verify_stamp(body, &stamp).map(|_| ()).map_err(|err| {
        debug!("rejecting stamp: {err}");
        error_response(401, &err.to_string())
    })
}

fn handle_whoami(state: &MockApiState, body: &[u8]) -> HttpResponse {
    let req: WhoamiRequest = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => return error_response(400, &format!("invalid whoami request: {err}")),
    };
    if !state.knows(&req.organization_id) {
        return error_response(
            403,
            &format!("organization '{}' not found", req.organization_id),
        );
    }
    let whoami = Whoami {
        organization_id: req.organization_id.clone(),
        organization_name: format!("{} (mock)", req.organization_id),
        user_id: "mock-user".to_string(),
        username: "mock".to_string(),
    };
    match serde_json::to_value(&whoami) {
        Ok(v) => json_response(200, v),
        Err(err) => error_response(500, &err.to_string()),
    }
}

fn handle_sign(state: &MockApiState, body: &[u8]) -> HttpResponse {
    let req: SignRawPayloadRequest = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => return error_response(400, &format!("invalid sign request: {err}")),
    };
    if req.activity_type != ACTIVITY_TYPE_SIGN_RAW_PAYLOAD {
        return error_response(
            400,
            &format!("unsupported activity type '{}'", req.activity_type),
        );
    }
    if state.fail_signing.load(Ordering::SeqCst) {
        return error_response(500, "signing is disabled on this mock");
    }

    let digest = Sha256::digest(req.parameters.payload.as_bytes());
    let response = ActivityResponse {
        activity: Activity {
            id: format!("mock-{}", hex::encode(&digest[..8])),
            status: ACTIVITY_STATUS_COMPLETED.to_string(),
            activity_type: req.activity_type.clone(),
            organization_id: req.organization_id.clone(),
            result: Some(ActivityResult {
                sign_raw_payload_result: Some(RawSignature {
                    r: hex::encode(&digest[..16]),
                    s: hex::encode(&digest[16..]),
                    v: "00".to_string(),
                }),
            }),
        },
    };
    match serde_json::to_value(&response) {
        Ok(v) => json_response(200, v),
        Err(err) => error_response(500, &err.to_string()),
    }
}

fn error_response(code: u16, message: &str) -> HttpResponse {
    json_response(code, json!({ "code": code, "message": message }))
}

fn json_response(code: u16, value: serde_json::Value) -> HttpResponse {
    let body = serde_json::to_vec(&value).unwrap_or_default();
    let mut response = Response::from_data(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    response
}
