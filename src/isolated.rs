//! Isolated execution context for delegated stamping.
//!
//! A context is a dedicated task that owns an ephemeral HPKE key pair and,
//! once a credential bundle has been injected, the decrypted API key. The
//! rest of the process only talks to it through messages, so the key never
//! leaves the task.
//!
//! Lifecycle: [`ContextHost`] holds at most one context. Provisioning a new
//! one removes the previous context first and waits for its task to exit.
//! Contexts are not torn down at the end of a run.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bundle;
use crate::error::{Result, SignError};
use crate::stamper::{ApiKeyStamper, Stamp, Stamper};

pub const DEFAULT_ELEMENT_ID: &str = "turnkey-auth-iframe";
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_BUFFER: usize = 64;

enum Command {
    Inject {
        bundle: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stamp {
        body: Vec<u8>,
        reply: oneshot::Sender<Result<Stamp>>,
    },
    Shutdown,
}

/// Decrements the live-context count when the context task exits.
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle to a running context. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ContextHandle {
    element_id: String,
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Inject { .. } => f.write_str("Inject"),
            Command::Stamp { body, .. } => write!(f, "Stamp({} bytes)", body.len()),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ContextHandle {
    pub fn element_id(&self) -> &str {
        &self.element_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| {
            SignError::provisioning(format!(
                "isolated context '{}' has been removed",
                self.element_id
            ))
        })?;
        rx.await.map_err(|_| {
            SignError::provisioning(format!(
                "isolated context '{}' exited before replying",
                self.element_id
            ))
        })?
    }

    /// Hand an encoded credential bundle to the context and wait for it to load.
    pub async fn inject_credential_bundle(&self, bundle: &str) -> Result<()> {
        let bundle = bundle.to_string();
        self.request(|reply| Command::Inject { bundle, reply })
            .await
            .map_err(|err| match err {
                SignError::CredentialPackaging(msg) | SignError::Configuration(msg) => {
                    SignError::provisioning(format!(
                        "isolated context rejected credential bundle: {msg}"
                    ))
                }
                other => other,
            })
    }

    pub async fn stamp(&self, body: &[u8]) -> Result<Stamp> {
        let body = body.to_vec();
        self.request(|reply| Command::Stamp { body, reply }).await
    }
}

/// A live context owned by a [`ContextHost`].
struct IsolatedContext {
    handle: ContextHandle,
    task: JoinHandle<()>,
}

impl IsolatedContext {
    /// Spawn the context task and wait for its ephemeral public key.
    async fn init(
        element_id: &str,
        timeout: Duration,
        live: &Arc<AtomicUsize>,
    ) -> Result<(Self, String)> {
        Self::spawn(element_id, timeout, live, run_context).await
    }

    async fn spawn<F, Fut>(
        element_id: &str,
        timeout: Duration,
        live: &Arc<AtomicUsize>,
        body: F,
    ) -> Result<(Self, String)>
    where
        F: FnOnce(String, mpsc::Receiver<Command>, oneshot::Sender<String>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let guard = LiveGuard::enter(live);
        let context_body = body(element_id.to_string(), rx, ready_tx);
        let task = tokio::spawn(async move {
            let _guard = guard;
            context_body.await;
        });

        let handle = ContextHandle {
            element_id: element_id.to_string(),
            commands,
        };
        let context = IsolatedContext { handle, task };

        let public_key = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(key)) => key,
            Ok(Err(_)) => {
                context.remove().await;
                return Err(SignError::provisioning(format!(
                    "isolated context '{element_id}' exited during init"
                )));
            }
            Err(_) => {
                context.remove().await;
                return Err(SignError::provisioning(format!(
                    "isolated context '{element_id}' did not report a public key within {}ms",
                    timeout.as_millis()
                )));
            }
        };
        Ok((context, public_key))
    }

    async fn remove(self) {
        // Outstanding handles keep the channel open, so shutdown is explicit.
        let _ = self.handle.commands.send(Command::Shutdown).await;
        drop(self.handle);
        if self.task.await.is_err() {
            warn!("isolated context task panicked during shutdown");
        }
    }
}

async fn run_context(
    element_id: String,
    mut commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<String>,
) {
    let (private, public) = bundle::generate_receiver_keypair();
    let public_hex = bundle::receiver_public_hex(&public);
    if ready.send(public_hex).is_err() {
        return;
    }
    debug!(element_id = %element_id, "isolated context ready");

    let mut credential: Option<ApiKeyStamper> = None;
    while let Some(cmd) = commands.recv().await {
        match cmd {
            Command::Inject { bundle: encoded, reply } => {
                let loaded = bundle::decode_bundle(&encoded)
                    .and_then(|sealed| bundle::hpke_decrypt(&sealed, &private, &public))
                    .and_then(|key| ApiKeyStamper::from_private_key_bytes(&key));
                let outcome = match loaded {
                    Ok(stamper) => {
                        debug!(
                            element_id = %element_id,
                            public_key = %stamper.public_key_hex(),
                            "credential loaded into isolated context"
                        );
                        credential = Some(stamper);
                        Ok(())
                    }
                    Err(err) => Err(err),
                };
                let _ = reply.send(outcome);
            }
            Command::Stamp { body, reply } => {
                let outcome = match credential.as_ref() {
                    Some(stamper) => stamper.stamp_now(&body),
                    None => Err(SignError::provisioning(format!(
                        "isolated context '{element_id}' has no credential loaded"
                    ))),
                };
                let _ = reply.send(outcome);
            }
            Command::Shutdown => break,
        }
    }
    debug!(element_id = %element_id, "isolated context stopped");
}

/// Owner of the single isolated context, the container it lives in.
#[derive(Default)]
pub struct ContextHost {
    slot: Mutex<Option<IsolatedContext>>,
    live: Arc<AtomicUsize>,
}

static GLOBAL_HOST: Lazy<ContextHost> = Lazy::new(ContextHost::default);

impl ContextHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide host, created on first use.
    pub fn global() -> &'static ContextHost {
        &GLOBAL_HOST
    }

    /// Number of context tasks currently alive.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Handle to the current context, if one is installed.
    pub async fn current(&self) -> Option<ContextHandle> {
        self.slot.lock().await.as_ref().map(|c| c.handle.clone())
    }

    /// Remove any existing context, then create a fresh one.
    ///
    /// Returns the new context's handle and its ephemeral public key
    /// (uncompressed SEC1 hex).
    pub async fn replace(
        &self,
        element_id: &str,
        timeout: Duration,
    ) -> Result<(ContextHandle, String)> {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            warn!(element_id = %previous.handle.element_id, "removing existing isolated context");
            previous.remove().await;
        }

        let (context, public_key) = IsolatedContext::init(element_id, timeout, &self.live).await?;
        info!(element_id = %element_id, "isolated context initialized");
        let handle = context.handle.clone();
        *slot = Some(context);
        Ok((handle, public_key))
    }

    /// Tear down the current context, if any.
    pub async fn remove(&self) {
        if let Some(previous) = self.slot.lock().await.take() {
            previous.remove().await;
        }
    }
}

/// Stamper that forwards every request to an isolated context.
#[derive(Clone, Debug)]
pub struct DelegatedStamper {
    handle: ContextHandle,
}

impl DelegatedStamper {
    pub fn new(handle: ContextHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Stamper for DelegatedStamper {
    async fn stamp(&self, body: &[u8]) -> Result<Stamp> {
        self.handle.stamp(body).await
    }
}
