//! Parallel dispatch harness.
//!
//! One run: identity check, then `N` signing requests built and spawned
//! back to back, then a barrier on all of them. The identity check is not
//! part of the timed region.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::client::SigningClient;
use crate::config::Configuration;
use crate::error::Result;
use crate::fan_out;
use crate::request::{now_ms, SignRawPayloadRequest};

/// What each of the `N` concurrent operations does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Send each signing activity to the API and wait for its response.
    #[default]
    Submit,
    /// Only serialize and stamp each activity; nothing is sent.
    StampOnly,
}

/// Timing of one successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkResult {
    pub count: usize,
    pub start_ms: u128,
    pub end_ms: u128,
    pub duration_ms: u128,
}

impl fmt::Display for BenchmarkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Result: {} signatures performed in {}ms",
            self.count, self.duration_ms
        )
    }
}

/// Run one benchmark against `client`.
///
/// Fails without issuing any signing request if the identity check fails.
/// Fails with the first error from any signing request; no partial result
/// is produced.
pub async fn run(
    client: Arc<dyn SigningClient>,
    config: &Configuration,
    mode: DispatchMode,
) -> Result<BenchmarkResult> {
    let whoami = client.whoami(&config.organization_id).await?;
    info!(
        organization_id = %whoami.organization_id,
        organization_name = %whoami.organization_name,
        user_id = %whoami.user_id,
        username = %whoami.username,
        "identity check passed"
    );

    let count = config.request_count();
    let start_ms = now_ms();
    let clock = Instant::now();

    let mut rng = SmallRng::from_entropy();
    let handles = fan_out::spawn_all((0..count).map(|index| {
        let request = SignRawPayloadRequest::build(config, &mut rng);
        let client = Arc::clone(&client);
        debug!(index, payload = %request.parameters.payload, ?mode, "dispatching");
        async move {
            match mode {
                DispatchMode::Submit => client.sign_raw_payload(&request).await.map(|_| ()),
                DispatchMode::StampOnly => {
                    client.stamp_sign_raw_payload(&request).await.map(|_| ())
                }
            }
        }
    }));

    fan_out::join_all_or_first_error(handles).await?;

    let duration_ms = clock.elapsed().as_millis();
    let result = BenchmarkResult {
        count,
        start_ms,
        end_ms: start_ms + duration_ms,
        duration_ms,
    };
    info!(count, duration_ms = %result.duration_ms, ?mode, "run complete");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_line_matches_form_output() {
        let result = BenchmarkResult {
            count: 3,
            start_ms: 1_000,
            end_ms: 1_250,
            duration_ms: 250,
        };
        assert_eq!(
            result.to_string(),
            "Result: 3 signatures performed in 250ms"
        );
    }

    #[test]
    fn default_mode_submits() {
        assert_eq!(DispatchMode::default(), DispatchMode::Submit);
    }
}
