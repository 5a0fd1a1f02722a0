//! The Applier: one serialised pass of file materialisation, one-time
//! instruction execution, and periodic instruction execution.
//!
//! A process-wide mutex is held for the whole of [`Applier::apply`], so at
//! any instant at most one apply is in flight across every plan source.
//! While the lock is held an advisory interlock file (when configured) marks
//! the apply in progress for external observers; it is removed on every exit
//! path.
//!
//! Failure semantics:
//!
//! - Archive and codec failures are fatal to the call (`Err`).
//! - File materialisation and instruction failures are reported through
//!   `one_time_apply_succeeded=false`; the call still returns `Ok` so the
//!   driver can record failure feedback.
//! - A one-time instruction that exits non-zero (or cannot be started) stops
//!   the remaining one-time instructions.
//! - A periodic instruction that exits non-zero is recorded (`failures`,
//!   `lastFailedRunTime`) but the cycle continues; only a spawn failure
//!   aborts the remaining periodic instructions.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sentinel_common::{codec, timefmt, CalculatedPlan, PeriodicInstructionOutput};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::exec::{self, CaptureMode};
use crate::file;
use crate::image::ImageStager;

const APPLIED_PLAN_FILE_SUFFIX: &str = "-applied.plan";
const INTERLOCK_FILE_NAME: &str = "apply.lock";

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to archive applied plan: {0}")]
    Archive(std::io::Error),
    #[error("failed to serialise applied plan: {0}")]
    ArchiveEncode(serde_json::Error),
    #[error("failed to place interlock file: {0}")]
    Interlock(std::io::Error),
    #[error("failed to clean work directory: {0}")]
    WorkDirCleanup(std::io::Error),
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

/// One apply request.
#[derive(Debug, Clone, Default)]
pub struct ApplyInput {
    pub calculated_plan: CalculatedPlan,
    pub reconcile_files: bool,
    pub run_one_time_instructions: bool,
    pub existing_one_time_output: Vec<u8>,
    pub existing_periodic_output: Vec<u8>,
    /// One-based attempt number surfaced to instructions via the
    /// environment.
    pub one_time_instruction_attempts: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOutput {
    pub one_time_apply_succeeded: bool,
    pub one_time_output: Vec<u8>,
    pub periodic_apply_succeeded: bool,
    pub periodic_output: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub work_dir: PathBuf,
    pub preserve_work_dir: bool,
    pub applied_plan_dir: Option<PathBuf>,
    pub interlock_dir: Option<PathBuf>,
}

pub struct Applier {
    lock: tokio::sync::Mutex<()>,
    options: ApplierOptions,
    stager: Arc<dyn ImageStager>,
}

impl Applier {
    pub fn new(options: ApplierOptions, stager: Arc<dyn ImageStager>) -> Self {
        Applier {
            lock: tokio::sync::Mutex::new(()),
            options,
            stager,
        }
    }

    /// Apply one calculated plan. See the module docs for the pipeline and
    /// failure semantics.
    pub async fn apply(
        &self,
        ctx: &CancellationToken,
        input: ApplyInput,
    ) -> Result<ApplyOutput, ApplyError> {
        let cp = &input.calculated_plan;
        info!(checksum = %cp.checksum, "applying plan");
        trace!("waiting for applier lock");
        let _serialised = self.lock.lock().await;
        trace!("applier lock acquired");

        let now = Utc::now();
        let date_code = timefmt::archive_date_code(now);
        let execution_dir = self.options.work_dir.join(&date_code);

        let _interlock = self.place_interlock(&cp.checksum)?;

        if let Some(dir) = &self.options.applied_plan_dir {
            self.archive_plan(dir, &date_code, cp)?;
        }

        let carried = || ApplyOutput {
            one_time_apply_succeeded: false,
            one_time_output: input.existing_one_time_output.clone(),
            periodic_apply_succeeded: false,
            periodic_output: input.existing_periodic_output.clone(),
        };

        if input.reconcile_files {
            for entry in &cp.plan.files {
                if let Err(err) = file::apply_file(entry) {
                    error!(path = %entry.path, %err, "failed to materialise file");
                    return Ok(carried());
                }
            }
        }

        let (one_time_apply_succeeded, one_time_output) = if input.run_one_time_instructions {
            let mut outputs = codec::decode_one_time(&input.existing_one_time_output)?;
            let succeeded = self
                .run_one_time(ctx, cp, &execution_dir, &mut outputs, &input)
                .await;
            (succeeded, codec::encode_one_time(&outputs)?)
        } else {
            // By convention a skipped one-time pass reports not-succeeded
            // and carries the previous output forward untouched.
            (false, input.existing_one_time_output.clone())
        };

        if !self.options.preserve_work_dir {
            debug!(dir = %self.options.work_dir.display(), "clearing work directory");
            match fs::remove_dir_all(&self.options.work_dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ApplyError::WorkDirCleanup(err)),
            }
        }

        let mut periodic_outputs = codec::decode_periodic(&input.existing_periodic_output)?;
        let periodic_apply_succeeded = self
            .run_periodic(ctx, cp, &execution_dir, now, &mut periodic_outputs)
            .await;
        let periodic_output = codec::encode_periodic(&periodic_outputs)?;

        Ok(ApplyOutput {
            one_time_apply_succeeded,
            one_time_output,
            periodic_apply_succeeded,
            periodic_output,
        })
    }

    async fn run_one_time(
        &self,
        ctx: &CancellationToken,
        cp: &CalculatedPlan,
        execution_dir: &Path,
        outputs: &mut BTreeMap<String, Vec<u8>>,
        input: &ApplyInput,
    ) -> bool {
        for (index, instruction) in cp.plan.one_time_instructions.iter().enumerate() {
            if ctx.is_cancelled() {
                return false;
            }
            debug!(index, checksum = %cp.checksum, "executing one-time instruction");
            let prefix = format!("{}_{}", cp.checksum, index);
            let dir = execution_dir.join(&prefix);

            let (combined, failed) = match exec::execute(
                ctx,
                self.stager.as_ref(),
                &prefix,
                &dir,
                &instruction.common,
                CaptureMode::Combined,
                input.one_time_instruction_attempts,
            )
            .await
            {
                Ok(run) => {
                    if run.exit_code != 0 {
                        error!(index, exit_code = run.exit_code, "instruction exited non-zero");
                    }
                    (run.stdout, run.exit_code != 0)
                }
                Err(err) => {
                    error!(index, %err, "error executing instruction");
                    (Vec::new(), true)
                }
            };

            if instruction.save_output {
                if instruction.common.name.is_empty() {
                    error!("instruction does not have a name set, cannot save output data");
                } else {
                    outputs.insert(instruction.common.name.clone(), combined);
                }
            }

            if failed {
                // Stop here so subsequent instructions do not run.
                return false;
            }
        }
        true
    }

    async fn run_periodic(
        &self,
        ctx: &CancellationToken,
        cp: &CalculatedPlan,
        execution_dir: &Path,
        now: DateTime<Utc>,
        outputs: &mut BTreeMap<String, PeriodicInstructionOutput>,
    ) -> bool {
        let now_string = timefmt::format_unix_date(now);
        for (index, instruction) in cp.plan.periodic_instructions.iter().enumerate() {
            if ctx.is_cancelled() {
                return false;
            }
            let name = &instruction.common.name;

            if let Some(previous) = outputs.get(name) {
                if let Some(last_run) = most_recent_run_time(previous) {
                    let period = Duration::seconds(instruction.effective_period_seconds());
                    if now < last_run + period {
                        debug!(%name, "period has not elapsed since last run, skipping");
                        continue;
                    }
                }
            }

            debug!(index, checksum = %cp.checksum, "executing periodic instruction");
            let prefix = format!("{}_{}", cp.checksum, index);
            let dir = execution_dir.join(&prefix);

            let result = exec::execute(
                ctx,
                self.stager.as_ref(),
                &prefix,
                &dir,
                &instruction.common,
                CaptureMode::Split,
                1,
            )
            .await;

            let (run, spawn_failed) = match result {
                Ok(run) => (run, false),
                Err(err) => {
                    error!(index, %err, "error executing periodic instruction");
                    (
                        exec::RunOutput {
                            stdout: Vec::new(),
                            stderr: Vec::new(),
                            exit_code: -1,
                        },
                        true,
                    )
                }
            };

            if name.is_empty() {
                error!("instruction does not have a name set, cannot save output data");
            } else {
                let previous = outputs.get(name);
                let mut record = PeriodicInstructionOutput {
                    name: name.clone(),
                    stdout: run.stdout,
                    stderr: if instruction.save_stderr_output {
                        run.stderr
                    } else {
                        Vec::new()
                    },
                    exit_code: run.exit_code,
                    last_successful_run_time: previous
                        .map(|p| p.last_successful_run_time.clone())
                        .unwrap_or_default(),
                    last_failed_run_time: previous
                        .map(|p| p.last_failed_run_time.clone())
                        .unwrap_or_default(),
                    failures: previous.map(|p| p.failures).unwrap_or_default(),
                };
                if run.exit_code == 0 && !spawn_failed {
                    record.last_successful_run_time = now_string.clone();
                    record.failures = 0;
                } else {
                    record.last_failed_run_time = now_string.clone();
                    record.failures += 1;
                }
                outputs.insert(name.clone(), record);
            }

            if spawn_failed {
                return false;
            }
        }
        true
    }

    fn archive_plan(
        &self,
        dir: &Path,
        date_code: &str,
        cp: &CalculatedPlan,
    ) -> Result<(), ApplyError> {
        debug!(dir = %dir.display(), "archiving applied plan");
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(ApplyError::Archive)?;
        let encoded = serde_json::to_vec(cp).map_err(ApplyError::ArchiveEncode)?;
        let path = dir.join(format!("{date_code}{APPLIED_PLAN_FILE_SUFFIX}"));
        let mut archive = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(ApplyError::Archive)?;
        archive.write_all(&encoded).map_err(ApplyError::Archive)
    }

    fn place_interlock(&self, checksum: &str) -> Result<Option<InterlockGuard>, ApplyError> {
        let Some(dir) = &self.options.interlock_dir else {
            return Ok(None);
        };
        fs::create_dir_all(dir).map_err(ApplyError::Interlock)?;
        let path = dir.join(INTERLOCK_FILE_NAME);
        fs::write(&path, checksum).map_err(ApplyError::Interlock)?;
        Ok(Some(InterlockGuard { path }))
    }
}

/// Advisory marker that an apply is in progress; removed on drop so every
/// exit path clears it.
struct InterlockGuard {
    path: PathBuf,
}

impl Drop for InterlockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.path.display(), %err, "failed to remove interlock file");
            }
        }
    }
}

/// Most recent of the success/failure run times, if either parses.
fn most_recent_run_time(output: &PeriodicInstructionOutput) -> Option<DateTime<Utc>> {
    let success = timefmt::parse_unix_date(&output.last_successful_run_time).ok();
    let failure = timefmt::parse_unix_date(&output.last_failed_run_time).ok();
    match (success, failure) {
        (Some(s), Some(f)) => Some(s.max(f)),
        (Some(s), None) => Some(s),
        (None, Some(f)) => Some(f),
        (None, None) => None,
    }
}
