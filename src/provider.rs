use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bundle;
use crate::config::Configuration;
use crate::error::{Result, SignError};
use crate::isolated::{ContextHost, DelegatedStamper, DEFAULT_ELEMENT_ID};
use crate::stamper::{ApiKeyStamper, Stamper};

/// Factory: build the stamper selected by `config.stamper_type`.
///
/// `API_KEY` stamps directly. Anything else provisions a fresh isolated
/// context on `host` (replacing the previous one) and injects the private
/// key into it as an HPKE-sealed, base58check-encoded bundle.
pub async fn build_stamper(
    config: &Configuration,
    host: &ContextHost,
    init_timeout: Duration,
) -> Result<Arc<dyn Stamper>> {
    if config.stamper_type.is_delegated() {
        let stamper = provision_delegated(config, host, init_timeout).await?;
        return Ok(Arc::new(stamper));
    }
    let stamper = ApiKeyStamper::new(&config.api_public_key, &config.api_private_key)?;
    info!(public_key = %stamper.public_key_hex(), "using API key stamper");
    Ok(Arc::new(stamper))
}

async fn provision_delegated(
    config: &Configuration,
    host: &ContextHost,
    init_timeout: Duration,
) -> Result<DelegatedStamper> {
    let private_key = hex::decode(config.api_private_key.trim())
        .map_err(|err| SignError::configuration(format!("API private key is not hex: {err}")))?;
    // Reject unusable scalars here; the context would only see a sealed bundle.
    ApiKeyStamper::from_private_key_bytes(&private_key)?;

    let (handle, context_public_key) = host.replace(DEFAULT_ELEMENT_ID, init_timeout).await?;

    let target = hex::decode(&context_public_key).map_err(|err| {
        SignError::packaging(format!("isolated context public key is not hex: {err}"))
    })?;
    let sealed = bundle::hpke_encrypt(&private_key, &target)?;
    let encoded = bundle::encode_bundle(&sealed);

    debug!(bundle_len = encoded.len(), "injecting credential bundle into isolated context");
    handle.inject_credential_bundle(&encoded).await?;
    info!(element_id = %handle.element_id(), "using delegated stamper");

    Ok(DelegatedStamper::new(handle))
}
