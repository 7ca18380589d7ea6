//! Readiness/health check probes.
//!
//! A check combines two signals: the container's status from the runtime
//! (an exited or vanished container short-circuits everything) and, when
//! the spec configures an endpoint, an HTTP probe against the instance's
//! address. Instances without an endpoint count as passing while their
//! container runs.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use drover_core::CheckSpec;

use crate::runtime::{ContainerId, ContainerRuntime, ContainerStatus, RuntimeError};

/// Outcome of one check attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Container running and (if probed) the endpoint answered 2xx.
    Healthy,
    /// Container running but the endpoint refused, errored, or timed out.
    Unhealthy,
    /// Container exited or disappeared — checks are moot.
    Stopped,
}

/// Parsed check parameters, ready for the state machine's loops.
#[derive(Debug, Clone, Copy)]
pub struct CheckPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl CheckPolicy {
    /// Parse a `CheckSpec`, falling back to safe defaults on bad values.
    pub fn from_spec(spec: &CheckSpec) -> Self {
        Self {
            interval: parse_duration(&spec.interval).unwrap_or(Duration::from_secs(5)),
            timeout: parse_duration(&spec.timeout).unwrap_or(Duration::from_secs(2)),
            max_attempts: spec.max_attempts.max(1),
            initial_delay: spec
                .initial_delay
                .as_deref()
                .and_then(parse_duration)
                .unwrap_or(Duration::ZERO),
        }
    }
}

/// Run one check attempt for an instance.
pub async fn check_instance(
    runtime: &Arc<dyn ContainerRuntime>,
    container_id: &ContainerId,
    probe_addr: Option<&str>,
    endpoint: &str,
    timeout: Duration,
) -> CheckOutcome {
    match runtime.inspect(container_id).await {
        Ok(ContainerStatus::Running) => {}
        Ok(ContainerStatus::Created) => return CheckOutcome::Unhealthy,
        Ok(ContainerStatus::Exited { .. }) => return CheckOutcome::Stopped,
        Err(RuntimeError::NotFound(_)) => return CheckOutcome::Stopped,
        Err(e) => {
            debug!(container = %container_id, error = %e, "inspect failed during check");
            return CheckOutcome::Unhealthy;
        }
    }

    match (probe_addr, endpoint.is_empty()) {
        // No endpoint configured: a running container is a passing check.
        (_, true) | (None, _) => CheckOutcome::Healthy,
        (Some(addr), false) => match http_probe(addr, endpoint, timeout).await {
            ProbeResult::Healthy => CheckOutcome::Healthy,
            ProbeResult::Unhealthy | ProbeResult::Failed => CheckOutcome::Unhealthy,
        },
    }
}

/// Result of a single HTTP probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The endpoint returned 2xx.
    Healthy,
    /// The endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

/// Perform an HTTP health probe against an endpoint.
///
/// Returns `Healthy` if the response is 2xx, `Unhealthy` for non-2xx,
/// or `Failed` if the connection fails or times out.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "drover-executor/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request build failed");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) => {
                if resp.status().is_success() {
                    ProbeResult::Healthy
                } else {
                    debug!(status = %resp.status(), %uri, "health probe non-2xx");
                    ProbeResult::Unhealthy
                }
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%uri, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
