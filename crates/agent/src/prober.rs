//! HTTP health probing with threshold-based health transitions.
//!
//! A probe run never fails the caller: network and TLS errors count as probe
//! failures and feed the same threshold bookkeeping as a non-2xx response.

use std::collections::BTreeMap;
use std::time::Duration;

use sentinel_common::{Probe, ProbeStatus};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

const DEFAULT_TIMEOUT_SECONDS: i64 = 1;
const DEFAULT_SUCCESS_THRESHOLD: i32 = 1;
const DEFAULT_FAILURE_THRESHOLD: i32 = 3;

/// Run one probe attempt and fold the result into `status`.
///
/// When `first_attempt` is set the probe sleeps `initial_delay_seconds`
/// before its HTTP attempt.
pub async fn run_probe(
    ctx: &CancellationToken,
    probe: &Probe,
    status: &mut ProbeStatus,
    first_attempt: bool,
) {
    trace!(name = %probe.name, url = %probe.http_get.url, "running probe");
    if first_attempt && probe.initial_delay_seconds > 0 {
        debug!(
            name = %probe.name,
            seconds = probe.initial_delay_seconds,
            "sleeping before first probe attempt"
        );
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(probe.initial_delay_seconds as u64)) => {}
            _ = ctx.cancelled() => return,
        }
    }

    let success = tokio::select! {
        success = attempt(probe) => success,
        _ = ctx.cancelled() => return,
    };
    observe(status, success, probe.success_threshold, probe.failure_threshold);
}

/// One HTTP attempt; true iff the response status is 2xx.
async fn attempt(probe: &Probe) -> bool {
    let client = match build_client(probe) {
        Ok(client) => client,
        Err(err) => {
            error!(name = %probe.name, %err, "error building probe client");
            return false;
        }
    };
    match client.get(&probe.http_get.url).send().await {
        Ok(response) => {
            debug!(name = %probe.name, status = %response.status(), "probe response");
            response.status().is_success()
        }
        Err(err) => {
            error!(name = %probe.name, %err, "error while running probe");
            false
        }
    }
}

fn build_client(probe: &Probe) -> reqwest::Result<reqwest::Client> {
    let timeout = if probe.timeout_seconds > 0 {
        probe.timeout_seconds
    } else {
        DEFAULT_TIMEOUT_SECONDS
    };
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout as u64))
        .use_rustls_tls();

    let action = &probe.http_get;
    if action.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    } else {
        if !action.ca_cert.is_empty() {
            match std::fs::read(&action.ca_cert)
                .map_err(anyhow::Error::from)
                .and_then(|pem| reqwest::Certificate::from_pem(&pem).map_err(Into::into))
            {
                Ok(cert) => builder = builder.add_root_certificate(cert),
                Err(err) => {
                    error!(path = %action.ca_cert, %err, "error loading CA cert, continuing without it")
                }
            }
        }
        if !action.client_cert.is_empty() && !action.client_key.is_empty() {
            match load_identity(&action.client_key, &action.client_cert) {
                Ok(identity) => builder = builder.identity(identity),
                Err(err) => {
                    error!(
                        cert = %action.client_cert,
                        key = %action.client_key,
                        %err,
                        "error loading client cert/key, continuing without identity"
                    )
                }
            }
        }
    }
    builder.build()
}

fn load_identity(key_path: &str, cert_path: &str) -> anyhow::Result<reqwest::Identity> {
    let mut pem = std::fs::read(key_path)?;
    pem.extend_from_slice(&std::fs::read(cert_path)?);
    Ok(reqwest::Identity::from_pem(&pem)?)
}

/// Fold one sample into the threshold counters.
///
/// `healthy` only flips once the corresponding threshold is reached; between
/// the first sample and the threshold it keeps its previous value.
pub fn observe(
    status: &mut ProbeStatus,
    success: bool,
    success_threshold: i32,
    failure_threshold: i32,
) {
    let success_threshold = if success_threshold > 0 {
        success_threshold
    } else {
        DEFAULT_SUCCESS_THRESHOLD
    };
    let failure_threshold = if failure_threshold > 0 {
        failure_threshold
    } else {
        DEFAULT_FAILURE_THRESHOLD
    };

    if success {
        if status.success_count < success_threshold {
            status.success_count += 1;
            if status.success_count >= success_threshold {
                status.healthy = true;
            }
        }
        status.failure_count = 0;
    } else {
        if status.failure_count < failure_threshold {
            status.failure_count += 1;
            if status.failure_count >= failure_threshold {
                status.healthy = false;
            }
        }
        status.success_count = 0;
    }
}

/// Run every probe in parallel and merge the updated statuses back into
/// `statuses`. Each task works on its own copy; the map is only touched at
/// the join, so no shared-map locking is needed.
pub async fn run_probes(
    ctx: &CancellationToken,
    probes: &BTreeMap<String, Probe>,
    statuses: &mut BTreeMap<String, ProbeStatus>,
    first_attempt: bool,
) {
    let mut tasks = JoinSet::new();
    for (name, probe) in probes {
        let ctx = ctx.clone();
        let name = name.clone();
        let probe = probe.clone();
        let mut status = statuses.get(&name).copied().unwrap_or_default();
        tasks.spawn(async move {
            run_probe(&ctx, &probe, &mut status, first_attempt).await;
            (name, status)
        });
    }
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((name, status)) => {
                statuses.insert(name, status);
            }
            Err(err) => error!(%err, "probe task panicked"),
        }
    }
}
