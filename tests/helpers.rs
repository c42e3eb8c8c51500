#![allow(dead_code)]

use std::env;
use std::ffi::{OsStr, OsString};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use parallel_sign::client::{
    Activity, ActivityResponse, SigningClient, StampedRequest, Whoami,
    ACTIVITY_STATUS_COMPLETED,
};
use parallel_sign::request::SignRawPayloadRequest;
use parallel_sign::stamper::{ApiKeyStamper, Stamper};
use parallel_sign::{Result, SignError};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    match ENV_LOCK.get_or_init(|| Mutex::new(())).lock() {
        Ok(g) => g,
        // A test that panicked while holding the lock must not wedge the rest.
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// RAII guard for test-only env var mutation.
///
/// All mutations through this guard are serialized with a global lock.
#[must_use]
pub struct EnvVarGuard {
    key: String,
    old: Option<OsString>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvVarGuard {
    pub fn set<K: Into<String>, V: AsRef<OsStr>>(key: K, value: V) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        unsafe {
            env::set_var(&key, value);
        }
        Self {
            key,
            old,
            _lock: lock,
        }
    }

    pub fn unset<K: Into<String>>(key: K) -> Self {
        let key = key.into();
        let lock = env_lock();
        let old = env::var_os(&key);
        unsafe {
            env::remove_var(&key);
        }
        Self {
            key,
            old,
            _lock: lock,
        }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.old {
                Some(v) => env::set_var(&self.key, v),
                None => env::remove_var(&self.key),
            }
        }
    }
}

/// Fresh directory under the system temp dir, unique per call.
pub fn unique_test_temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = env::temp_dir().join(format!(
        "parallel-sign-{prefix}-{}-{nanos}-{n}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub fn reserve_local_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

pub fn local_addr() -> String {
    format!("127.0.0.1:{}", reserve_local_port())
}

/// Scripted in-memory [`SigningClient`].
///
/// Counts calls, tracks the peak number of concurrent submissions, and can
/// be told to reject the identity check or fail one specific submission.
pub struct FakeClient {
    pub reject_whoami: bool,
    pub delay: Duration,
    /// Per-submission delays by index; overrides `delay` where present.
    pub delays: Vec<Duration>,
    /// Zero-based submission index that fails.
    pub fail_at: Option<usize>,
    pub stamper: Option<ApiKeyStamper>,
    pub(crate) whoami_calls: AtomicUsize,
    pub(crate) submissions: AtomicUsize,
    pub(crate) completions: AtomicUsize,
    pub(crate) stamped: AtomicUsize,
    pub(crate) in_flight: AtomicUsize,
    pub(crate) peak_in_flight: AtomicUsize,
    pub(crate) payloads: Mutex<Vec<String>>,
    pub(crate) completion_order: Mutex<Vec<usize>>,
}

impl Default for FakeClient {
    fn default() -> Self {
        Self {
            reject_whoami: false,
            delay: Duration::ZERO,
            delays: Vec::new(),
            fail_at: None,
            stamper: None,
            whoami_calls: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
            stamped: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
            completion_order: Mutex::new(Vec::new()),
        }
    }
}

impl FakeClient {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn whoami_calls(&self) -> usize {
        self.whoami_calls.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn stamped(&self) -> usize {
        self.stamped.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Submission indexes in the order their calls finished.
    pub fn completion_order(&self) -> Vec<usize> {
        self.completion_order
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SigningClient for FakeClient {
    async fn whoami(&self, organization_id: &str) -> Result<Whoami> {
        self.whoami_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_whoami {
            return Err(SignError::remote("REMOTE_BAD_STATUS: 401 unauthorized"));
        }
        Ok(Whoami {
            organization_id: organization_id.to_string(),
            organization_name: "fake".to_string(),
            user_id: "u1".to_string(),
            username: "fake".to_string(),
        })
    }

    async fn sign_raw_payload(&self, request: &SignRawPayloadRequest) -> Result<ActivityResponse> {
        let index = self.submissions.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut payloads) = self.payloads.lock() {
            payloads.push(request.parameters.payload.clone());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(index).copied().unwrap_or(self.delay);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut order) = self.completion_order.lock() {
            order.push(index);
        }

        if self.fail_at == Some(index) {
            return Err(SignError::remote(format!(
                "REMOTE_BAD_STATUS: 500 submission {index} failed"
            )));
        }
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(ActivityResponse {
            activity: Activity {
                id: format!("fake-{index}"),
                status: ACTIVITY_STATUS_COMPLETED.to_string(),
                activity_type: request.activity_type.clone(),
                organization_id: request.organization_id.clone(),
                result: None,
            },
        })
    }

    async fn stamp_sign_raw_payload(
        &self,
        request: &SignRawPayloadRequest,
    ) -> Result<StampedRequest> {
        self.stamped.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(request)
            .map_err(|err| SignError::remote(format!("encode: {err}")))?;
        let stamper = self.stamper.clone().unwrap_or_else(ApiKeyStamper::generate);
        let stamp = stamper.stamp(body.as_bytes()).await?;
        Ok(StampedRequest {
            url: "fake://sign".to_string(),
            body,
            stamp,
        })
    }
}
