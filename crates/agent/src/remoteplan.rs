//! Remote plan source: versioned snapshots of one keyed object.
//!
//! The object's `plan` field is desired state; the remaining recognised keys
//! carry per-attempt feedback written back by this watcher. Snapshots are
//! processed strictly sequentially. Per plan checksum the feedback record
//! moves through a small state machine:
//!
//! ```text
//!          +--------+  first apply, success   +---------+
//! INIT --> | DIRTY  | ----------------------> | APPLIED |
//!          +--------+                         +---------+
//!             | failure                           | plan changes
//!             v                                   v
//!          +---------+  cooldown elapsed       (back to DIRTY for new c)
//!          | FAILING | ----------------+
//!          +---------+                 |
//!             ^       max-failures     |
//!             |  (terminal for this c) |
//!             +------------------------+
//! ```
//!
//! Ordering safety: the watcher refuses snapshots whose version is older
//! than its own last write (retriable), and refuses a changed object UID
//! outright (fatal — the object was deleted and recreated, which would
//! corrupt feedback interpretation). A stale remote update therefore never
//! overwrites a newer local attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sentinel_common::{checksum, timefmt, CalculatedPlan, ProbeStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::applier::{Applier, ApplyInput};
use crate::prober;
use crate::store::{ObjectSnapshot, ObjectStore, StoreError};

pub const PLAN_KEY: &str = "plan";
pub const APPLIED_CHECKSUM_KEY: &str = "applied-checksum";
pub const APPLIED_OUTPUT_KEY: &str = "applied-output";
pub const APPLIED_PERIODIC_OUTPUT_KEY: &str = "applied-periodic-output";
pub const FAILED_CHECKSUM_KEY: &str = "failed-checksum";
pub const FAILED_OUTPUT_KEY: &str = "failed-output";
pub const FAILURE_COUNT_KEY: &str = "failure-count";
pub const LAST_APPLY_TIME_KEY: &str = "last-apply-time";
pub const SUCCESS_COUNT_KEY: &str = "success-count";
pub const MAX_FAILURES_KEY: &str = "max-failures";
pub const PROBE_STATUSES_KEY: &str = "probe-statuses";
pub const PROBE_PERIOD_KEY: &str = "probe-period-seconds";

/// The keys this watcher computes; exactly these are re-applied onto a fresh
/// snapshot during conflict retry.
const FEEDBACK_KEYS: [&str; 9] = [
    PROBE_STATUSES_KEY,
    APPLIED_PERIODIC_OUTPUT_KEY,
    FAILED_CHECKSUM_KEY,
    FAILURE_COUNT_KEY,
    FAILED_OUTPUT_KEY,
    SUCCESS_COUNT_KEY,
    LAST_APPLY_TIME_KEY,
    APPLIED_CHECKSUM_KEY,
    APPLIED_OUTPUT_KEY,
];

const DEFAULT_PROBE_PERIOD: StdDuration = StdDuration::from_secs(5);
const COOLDOWN_PERIOD_SECONDS: i64 = 30;
const BACKOFF_FLOOR: StdDuration = StdDuration::from_secs(60);
const BACKOFF_CEILING: StdDuration = StdDuration::from_secs(300);

/// Fatal watcher failures; the process exits so a supervisor can restart
/// with clean state.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("object UID changed from {previous} to {current}; object was deleted and recreated")]
    UidChanged { previous: String, current: String },
    #[error("failed to subscribe to remote object: {0}")]
    Subscribe(String),
}

#[derive(Debug)]
enum ProcessError {
    Fatal(WatchError),
    Retriable(anyhow::Error),
}

#[derive(Debug, Default, PartialEq)]
struct Outcome {
    /// Re-fetch-and-process after this delay to drive the next
    /// probe/periodic cycle.
    reenqueue: Option<StdDuration>,
}

#[derive(Debug, Default)]
struct WatchState {
    /// Version of this watcher's last successful write; later snapshots
    /// below it are stale.
    last_written_version: Option<u64>,
    /// First-seen object UID, recorded on the first successful write.
    object_uid: Option<String>,
    /// Force one application on the first snapshot after process start.
    has_run_once: bool,
}

pub struct RemoteWatcher {
    applier: Arc<Applier>,
    store: Arc<dyn ObjectStore>,
    state: WatchState,
}

impl RemoteWatcher {
    pub fn new(applier: Arc<Applier>, store: Arc<dyn ObjectStore>) -> Self {
        RemoteWatcher {
            applier,
            store,
            state: WatchState::default(),
        }
    }

    /// Consume snapshots until cancelled. Retriable processing errors
    /// re-enqueue with exponential backoff; identity violations return.
    pub async fn run(mut self, ctx: CancellationToken) -> Result<(), WatchError> {
        let mut receiver = self
            .store
            .subscribe()
            .await
            .map_err(|e| WatchError::Subscribe(e.to_string()))?;
        info!("starting remote watch of plans");

        let mut backoff_exponent: u32 = 0;
        let mut wakeup: Option<tokio::time::Instant> = None;

        loop {
            let poll_now = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                received = receiver.recv() => match received {
                    Some(snapshot) => {
                        self.handle(&ctx, Some(snapshot), &mut backoff_exponent, &mut wakeup).await?;
                        continue;
                    }
                    None => {
                        warn!("snapshot stream closed, falling back to polling");
                        true
                    }
                },
                _ = tokio::time::sleep_until(
                    wakeup.unwrap_or_else(|| tokio::time::Instant::now() + StdDuration::from_secs(3600))
                ), if wakeup.is_some() => true,
            };

            if poll_now {
                wakeup = None;
                match self.store.get().await {
                    Ok(snapshot) => {
                        self.handle(&ctx, snapshot, &mut backoff_exponent, &mut wakeup)
                            .await?
                    }
                    Err(err) => {
                        warn!(%err, "failed to fetch snapshot");
                        wakeup = Some(next_backoff(&mut backoff_exponent));
                    }
                }
            }
        }
    }

    async fn handle(
        &mut self,
        ctx: &CancellationToken,
        snapshot: Option<ObjectSnapshot>,
        backoff_exponent: &mut u32,
        wakeup: &mut Option<tokio::time::Instant>,
    ) -> Result<(), WatchError> {
        match self.process_snapshot(ctx, snapshot).await {
            Ok(outcome) => {
                *backoff_exponent = 0;
                if let Some(delay) = outcome.reenqueue {
                    debug!(seconds = delay.as_secs(), "re-enqueueing plan object");
                    *wakeup = Some(tokio::time::Instant::now() + delay);
                }
                Ok(())
            }
            Err(ProcessError::Fatal(err)) => {
                error!(%err, "fatal error while processing snapshot");
                Err(err)
            }
            Err(ProcessError::Retriable(err)) => {
                warn!(%err, "retriable error while processing snapshot");
                *wakeup = Some(next_backoff(backoff_exponent));
                Ok(())
            }
        }
    }

    /// One sequential reconciliation of one snapshot.
    async fn process_snapshot(
        &mut self,
        ctx: &CancellationToken,
        snapshot: Option<ObjectSnapshot>,
    ) -> Result<Outcome, ProcessError> {
        let Some(snapshot) = snapshot else {
            debug!("plan object absent, re-enqueueing");
            return Ok(Outcome {
                reenqueue: Some(DEFAULT_PROBE_PERIOD),
            });
        };
        let original = snapshot.clone();
        let mut snapshot = snapshot;
        trace!(version = snapshot.version, uid = %snapshot.uid, "processing snapshot");

        if let Some(uid) = &self.state.object_uid {
            if *uid != snapshot.uid {
                return Err(ProcessError::Fatal(WatchError::UidChanged {
                    previous: uid.clone(),
                    current: snapshot.uid.clone(),
                }));
            }
        }
        if let Some(written) = self.state.last_written_version {
            if snapshot.version < written {
                error!(
                    received = snapshot.version,
                    written, "received snapshot older than the last snapshot operated on"
                );
                return Err(ProcessError::Retriable(anyhow::anyhow!(
                    "snapshot received was too old"
                )));
            }
        }

        let now = Utc::now();
        let probe_period = parse_probe_period(&snapshot.data);
        let last_apply_time = parse_last_apply_time(&snapshot.data, now);

        let Some(plan_raw) = snapshot.data.get(PLAN_KEY).cloned() else {
            debug!("snapshot carries no plan, re-enqueueing");
            return Ok(Outcome {
                reenqueue: Some(probe_period),
            });
        };
        let cp = CalculatedPlan::from_raw(&plan_raw)
            .map_err(|e| ProcessError::Retriable(e.into()))?;
        trace!(checksum = %cp.checksum, "calculated plan checksum");

        // needsApplied decides whether files are reconciled and one-time
        // instructions run for this snapshot.
        let mut needs_applied = true;
        if field_str(&snapshot.data, APPLIED_CHECKSUM_KEY) == Some(cp.checksum.as_str()) {
            debug!("applied checksum matches the plan from remote, not applying");
            needs_applied = false;
        }
        if !self.state.has_run_once {
            info!("detected first start, force-applying one-time instruction set");
            needs_applied = true;
            self.state.has_run_once = true;
        }

        let max_failures = field_str(&snapshot.data, MAX_FAILURES_KEY)
            .and_then(|raw| {
                raw.parse::<i64>()
                    .map_err(|err| error!(%raw, %err, "error parsing max-failures"))
                    .ok()
            })
            .unwrap_or(-1);
        let failure_count = field_str(&snapshot.data, FAILURE_COUNT_KEY)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(0);

        let mut was_failed = false;
        if failure_count != 0 {
            if let Some(failed_checksum) = field_str(&snapshot.data, FAILED_CHECKSUM_KEY) {
                if failed_checksum == cp.checksum {
                    debug!(failure_count, "plan appears to have failed before");
                    was_failed = true;
                    if max_failures != -1 && failure_count >= max_failures {
                        error!(
                            checksum = %cp.checksum,
                            failure_count,
                            max_failures,
                            "maximum failure threshold exceeded for plan"
                        );
                        needs_applied = false;
                    } else if now != last_apply_time
                        && now <= last_apply_time + Duration::seconds(COOLDOWN_PERIOD_SECONDS)
                    {
                        debug!("cooldown timer for failed plan application has not passed yet");
                        needs_applied = false;
                    }
                } else {
                    error!(
                        received = %cp.checksum,
                        failed = %failed_checksum,
                        "received plan checksum did not match failed plan checksum, cancelling failure cooldown"
                    );
                }
            }
        }

        if self.state.last_written_version == Some(snapshot.version) && !was_failed {
            debug!(
                version = snapshot.version,
                "last written version did not change; running probes, skipping apply"
            );
            needs_applied = false;
        }

        let existing_one_time_output = if was_failed {
            snapshot.data.get(FAILED_OUTPUT_KEY).cloned()
        } else {
            snapshot.data.get(APPLIED_OUTPUT_KEY).cloned()
        }
        .unwrap_or_default();
        let existing_periodic_output = snapshot
            .data
            .get(APPLIED_PERIODIC_OUTPUT_KEY)
            .cloned()
            .unwrap_or_default();

        let apply_output = self
            .applier
            .apply(
                ctx,
                ApplyInput {
                    calculated_plan: cp.clone(),
                    reconcile_files: needs_applied,
                    run_one_time_instructions: needs_applied,
                    existing_one_time_output,
                    existing_periodic_output,
                    one_time_instruction_attempts: (failure_count + 1).max(1) as u32,
                },
            )
            .await
            .map_err(|e| ProcessError::Retriable(e.into()))?;

        // Feedback transition. The write below is the only update.
        let now_string = timefmt::format_unix_date(now);
        snapshot.data.insert(
            APPLIED_PERIODIC_OUTPUT_KEY.to_string(),
            apply_output.periodic_output.clone(),
        );

        if (needs_applied && !apply_output.one_time_apply_succeeded)
            || (!needs_applied && was_failed)
        {
            debug!(
                checksum = %cp.checksum,
                "one-time instructions failed or plan is still in failure cooldown"
            );
            snapshot
                .data
                .insert(FAILED_CHECKSUM_KEY.to_string(), cp.checksum.clone().into_bytes());
            if needs_applied {
                let bumped = increment_count(snapshot.data.get(FAILURE_COUNT_KEY));
                snapshot.data.insert(FAILURE_COUNT_KEY.to_string(), bumped);
                snapshot.data.insert(
                    FAILED_OUTPUT_KEY.to_string(),
                    apply_output.one_time_output.clone(),
                );
                snapshot
                    .data
                    .insert(SUCCESS_COUNT_KEY.to_string(), b"0".to_vec());
                snapshot.data.insert(
                    LAST_APPLY_TIME_KEY.to_string(),
                    now_string.clone().into_bytes(),
                );
            }
        } else {
            debug!(checksum = %cp.checksum, "writing applied checksum to the remote plan");
            snapshot.data.insert(
                APPLIED_CHECKSUM_KEY.to_string(),
                cp.checksum.clone().into_bytes(),
            );
            snapshot.data.insert(
                APPLIED_OUTPUT_KEY.to_string(),
                apply_output.one_time_output.clone(),
            );
            snapshot
                .data
                .insert(FAILURE_COUNT_KEY.to_string(), b"0".to_vec());
            snapshot.data.insert(FAILED_OUTPUT_KEY.to_string(), Vec::new());
            snapshot
                .data
                .insert(FAILED_CHECKSUM_KEY.to_string(), Vec::new());
            if needs_applied {
                snapshot.data.insert(
                    LAST_APPLY_TIME_KEY.to_string(),
                    now_string.clone().into_bytes(),
                );
                let bumped = increment_count(snapshot.data.get(SUCCESS_COUNT_KEY));
                snapshot.data.insert(SUCCESS_COUNT_KEY.to_string(), bumped);
            }
        }

        let mut statuses = parse_probe_statuses(&snapshot.data);
        prober::run_probes(ctx, &cp.plan.probes, &mut statuses, needs_applied).await;
        match serde_json::to_vec(&statuses) {
            Ok(encoded) => {
                snapshot
                    .data
                    .insert(PROBE_STATUSES_KEY.to_string(), encoded);
            }
            Err(err) => error!(%err, "error while marshalling probe statuses"),
        }

        // Enqueue the next probe/periodic cycle when the one-time path is in
        // the expected state (ran-and-succeeded, or skipped outside cooldown).
        let reenqueue =
            (apply_output.one_time_apply_succeeded == needs_applied).then_some(probe_period);

        if snapshot.data == original.data {
            debug!("feedback did not change, not updating object");
            return Ok(Outcome { reenqueue });
        }

        self.write_back(snapshot, &cp.checksum).await?;
        Ok(Outcome { reenqueue })
    }

    /// Compare-and-set write with at most one refresh-and-retry. A conflict
    /// against a snapshot whose plan changed abandons the write; the next
    /// snapshot will redrive reconciliation.
    async fn write_back(
        &mut self,
        snapshot: ObjectSnapshot,
        applied_checksum: &str,
    ) -> Result<(), ProcessError> {
        let retriable =
            |err: StoreError| ProcessError::Retriable(anyhow::anyhow!("feedback write: {err}"));

        match self.store.update(&snapshot).await {
            Ok(stored) => {
                self.record_write(&stored);
                Ok(())
            }
            Err(StoreError::Conflict) => {
                let Some(mut latest) = self.store.get().await.map_err(retriable)? else {
                    warn!("object disappeared during write conflict, abandoning feedback write");
                    return Ok(());
                };
                let latest_checksum = latest.data.get(PLAN_KEY).map(|raw| checksum(raw));
                if latest_checksum.as_deref() != Some(applied_checksum) {
                    warn!(
                        "plan changed while resolving write conflict, abandoning feedback write"
                    );
                    return Ok(());
                }
                debug!(
                    version = latest.version,
                    "object version changed but plan checksum still matches, retrying write"
                );
                for key in FEEDBACK_KEYS {
                    match snapshot.data.get(key) {
                        Some(value) => {
                            latest.data.insert(key.to_string(), value.clone());
                        }
                        None => {
                            latest.data.remove(key);
                        }
                    }
                }
                match self.store.update(&latest).await {
                    Ok(stored) => {
                        self.record_write(&stored);
                        Ok(())
                    }
                    Err(StoreError::Conflict) => {
                        warn!("repeated write conflict, giving up on feedback write");
                        Ok(())
                    }
                    Err(err) => Err(retriable(err)),
                }
            }
            Err(err) => Err(retriable(err)),
        }
    }

    fn record_write(&mut self, stored: &ObjectSnapshot) {
        info!(version = stored.version, "updated plan object with feedback");
        self.state.last_written_version = Some(stored.version);
        if self.state.object_uid.is_none() {
            self.state.object_uid = Some(stored.uid.clone());
        }
    }
}

fn field_str<'a>(data: &'a BTreeMap<String, Vec<u8>>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(|raw| std::str::from_utf8(raw).ok())
}

fn parse_probe_period(data: &BTreeMap<String, Vec<u8>>) -> StdDuration {
    match field_str(data, PROBE_PERIOD_KEY) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(seconds) if seconds > 0 => StdDuration::from_secs(seconds),
            _ => {
                error!(%raw, "error parsing probe period, using default");
                DEFAULT_PROBE_PERIOD
            }
        },
        None => DEFAULT_PROBE_PERIOD,
    }
}

fn parse_last_apply_time(data: &BTreeMap<String, Vec<u8>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match field_str(data, LAST_APPLY_TIME_KEY) {
        Some(raw) => timefmt::parse_unix_date(raw).unwrap_or_else(|_| {
            error!(%raw, "error parsing last apply time, using current time");
            now
        }),
        None => now,
    }
}

fn parse_probe_statuses(data: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, ProbeStatus> {
    match data.get(PROBE_STATUSES_KEY) {
        Some(raw) => serde_json::from_slice(raw).unwrap_or_else(|err| {
            error!(%err, "error while parsing probe statuses");
            BTreeMap::new()
        }),
        None => BTreeMap::new(),
    }
}

/// Parse-and-increment for the decimal ASCII counters; anything unparsable
/// restarts the count at 1.
fn increment_count(count: Option<&Vec<u8>>) -> Vec<u8> {
    if let Some(raw) = count {
        if let Ok(current) = std::str::from_utf8(raw).unwrap_or("").parse::<i64>() {
            return (current + 1).to_string().into_bytes();
        }
    }
    b"1".to_vec()
}

fn next_backoff(exponent: &mut u32) -> tokio::time::Instant {
    let delay = BACKOFF_FLOOR
        .saturating_mul(2u32.saturating_pow(*exponent))
        .min(BACKOFF_CEILING);
    *exponent = exponent.saturating_add(1);
    tokio::time::Instant::now() + delay
}
