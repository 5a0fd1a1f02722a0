//! Local plan source: a polled directory of `*.plan` files.
//!
//! Every five seconds each base directory is walked; `*.plan` files are
//! processed in lexicographic path order unless shadowed by a sibling
//! `<name>.skip` marker or dot-prefixed. Each plan keeps a `<name>.pos`
//! position record next to it holding the last applied checksum, both output
//! blobs, and probe statuses. Errors on one plan are logged and do not stop
//! its siblings.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sentinel_common::codec::base64_bytes;
use sentinel_common::{CalculatedPlan, ProbeStatus};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::applier::{Applier, ApplyInput};
use crate::prober;

const PLAN_SUFFIX: &str = ".plan";
const POSITION_SUFFIX: &str = ".pos";
const SKIP_SUFFIX: &str = ".skip";
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Position record stored next to each plan file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanPosition {
    pub applied_checksum: String,
    #[serde(with = "base64_bytes")]
    pub output: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub periodic_output: Vec<u8>,
    pub probe_status: BTreeMap<String, ProbeStatus>,
}

pub struct LocalWatcher {
    applier: Arc<Applier>,
    bases: Vec<PathBuf>,
}

impl LocalWatcher {
    pub fn new(applier: Arc<Applier>, bases: Vec<PathBuf>) -> Self {
        LocalWatcher { applier, bases }
    }

    /// Poll until cancelled.
    pub async fn run(self, ctx: CancellationToken) {
        info!(bases = ?self.bases, "starting local watch of plans");
        loop {
            for base in &self.bases {
                if let Err(err) = self.scan_base(&ctx, base).await {
                    error!(base = %base.display(), %err, "failed to process plan directory");
                }
            }
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// One pass over one base directory.
    pub async fn scan_base(&self, ctx: &CancellationToken, base: &Path) -> std::io::Result<()> {
        let mut paths = Vec::new();
        let mut skips = HashSet::new();
        for entry in WalkDir::new(base) {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(shadowed) = name.strip_suffix(SKIP_SUFFIX) {
                skips.insert(shadowed.to_string());
            }
            paths.push(entry.into_path());
        }
        paths.sort();

        for path in paths {
            if ctx.is_cancelled() {
                return Ok(());
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if skip_file(&name, &skips) {
                continue;
            }
            debug!(path = %path.display(), "processing plan file");
            if let Err(err) = self.process_plan(ctx, &path).await {
                error!(path = %path.display(), %err, "error applying plan from file");
            }
        }
        Ok(())
    }

    async fn process_plan(&self, ctx: &CancellationToken, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read(path)?;
        let cp = CalculatedPlan::from_raw(&raw)?;

        let position_path = position_file_name(path);
        let position_raw = read_position_file(&position_path)?;
        let position = parse_position_data(&position_raw);

        let needs_applied = position.applied_checksum != cp.checksum;
        if needs_applied {
            info!(
                calculated = %cp.checksum,
                applied = %position.applied_checksum,
                "plan checksums differed"
            );
        } else {
            debug!(checksum = %cp.checksum, "plan checksum matched");
        }

        let apply_output = self
            .applier
            .apply(
                ctx,
                ApplyInput {
                    calculated_plan: cp.clone(),
                    reconcile_files: needs_applied,
                    run_one_time_instructions: needs_applied,
                    existing_one_time_output: position.output.clone(),
                    existing_periodic_output: position.periodic_output.clone(),
                    one_time_instruction_attempts: 1,
                },
            )
            .await?;

        let mut probe_status = position.probe_status.clone();
        prober::run_probes(ctx, &cp.plan.probes, &mut probe_status, needs_applied).await;

        let new_position = PlanPosition {
            applied_checksum: cp.checksum,
            output: apply_output.one_time_output,
            periodic_output: apply_output.periodic_output,
            probe_status,
        };
        let encoded = serde_json::to_vec(&new_position)?;
        if encoded != position_raw {
            debug!(path = %position_path.display(), "writing position data");
            let mut position_file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&position_path)?;
            position_file.write_all(&encoded)?;
        }
        Ok(())
    }
}

fn position_file_name(plan_path: &Path) -> PathBuf {
    let stem = plan_path
        .to_string_lossy()
        .strip_suffix(PLAN_SUFFIX)
        .map(str::to_string)
        .unwrap_or_else(|| plan_path.to_string_lossy().to_string());
    PathBuf::from(stem + POSITION_SUFFIX)
}

fn read_position_file(path: &Path) -> std::io::Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "position file did not exist");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

fn parse_position_data(data: &[u8]) -> PlanPosition {
    if data.is_empty() {
        return PlanPosition::default();
    }
    match serde_json::from_slice(data) {
        Ok(position) => position,
        Err(err) => {
            error!(%err, "error parsing position data, treating as first run");
            PlanPosition::default()
        }
    }
}

/// Plans are processed unless dot-prefixed, shadowed by a skip marker, or
/// not `*.plan` files at all.
fn skip_file(file_name: &str, skips: &HashSet<String>) -> bool {
    if file_name.starts_with('.') {
        return true;
    }
    if skips.contains(file_name) {
        return true;
    }
    !file_name.ends_with(PLAN_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    use crate::applier::ApplierOptions;
    use crate::image::{ImageStager, StageError};

    struct NoStager;

    #[async_trait]
    impl ImageStager for NoStager {
        async fn stage(&self, _dir: &Path, image: &str) -> Result<(), StageError> {
            Err(StageError::NotAvailable {
                image: image.to_string(),
            })
        }
    }

    fn watcher(tmp: &Path, bases: Vec<PathBuf>) -> LocalWatcher {
        let applier = Arc::new(Applier::new(
            ApplierOptions {
                work_dir: tmp.join("work"),
                preserve_work_dir: false,
                applied_plan_dir: None,
                interlock_dir: None,
            },
            Arc::new(NoStager),
        ));
        LocalWatcher::new(applier, bases)
    }

    #[test]
    fn skip_rules() {
        let mut skips = HashSet::new();
        skips.insert("b.plan".to_string());

        assert!(!skip_file("a.plan", &skips));
        assert!(skip_file("b.plan", &skips), "shadowed by b.plan.skip");
        assert!(skip_file(".hidden.plan", &skips));
        assert!(skip_file("notes.txt", &skips));
        assert!(skip_file("a.pos", &skips));
        assert!(skip_file("b.plan.skip", &skips));
    }

    #[test]
    fn position_file_name_replaces_suffix() {
        assert_eq!(
            position_file_name(Path::new("/plans/a.plan")),
            PathBuf::from("/plans/a.pos")
        );
    }

    #[test]
    fn position_parse_tolerates_garbage() {
        assert_eq!(parse_position_data(b""), PlanPosition::default());
        assert_eq!(parse_position_data(b"{broken"), PlanPosition::default());
    }

    #[test]
    fn position_round_trips_with_base64_byte_fields() {
        let position = PlanPosition {
            applied_checksum: "abc".to_string(),
            output: b"\x1f\x8bblob".to_vec(),
            periodic_output: b"other".to_vec(),
            probe_status: BTreeMap::new(),
        };
        let encoded = serde_json::to_vec(&position).unwrap();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.contains("appliedChecksum"));
        assert!(text.contains(&BASE64.encode(b"other")));
        let decoded: PlanPosition = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, position);
    }

    #[tokio::test]
    async fn first_scan_applies_plan_and_writes_position() {
        let tmp = tempfile::tempdir().unwrap();
        let plans = tmp.path().join("plans");
        std::fs::create_dir_all(&plans).unwrap();

        let target = tmp.path().join("materialised.txt");
        let plan = serde_json::json!({
            "files": [{
                "path": target.to_str().unwrap(),
                "content": BASE64.encode(b"hello from plan"),
                "permissions": "0644",
                "uid": -1,
                "gid": -1,
            }]
        });
        let raw = serde_json::to_vec(&plan).unwrap();
        std::fs::write(plans.join("a.plan"), &raw).unwrap();

        let w = watcher(tmp.path(), vec![plans.clone()]);
        let ctx = CancellationToken::new();
        w.scan_base(&ctx, &plans).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello from plan");

        let position = parse_position_data(&std::fs::read(plans.join("a.pos")).unwrap());
        assert_eq!(position.applied_checksum, sentinel_common::checksum(&raw));
    }

    #[tokio::test]
    async fn unchanged_plan_skips_one_time_instructions() {
        let tmp = tempfile::tempdir().unwrap();
        let plans = tmp.path().join("plans");
        std::fs::create_dir_all(&plans).unwrap();

        let counter = tmp.path().join("count");
        let plan = serde_json::json!({
            "instructions": [{
                "name": "count",
                "command": "sh",
                "args": ["-c", format!("echo x >> {}", counter.display())],
            }]
        });
        std::fs::write(plans.join("a.plan"), serde_json::to_vec(&plan).unwrap()).unwrap();

        let w = watcher(tmp.path(), vec![plans.clone()]);
        let ctx = CancellationToken::new();
        w.scan_base(&ctx, &plans).await.unwrap();
        w.scan_base(&ctx, &plans).await.unwrap();

        // the instruction ran exactly once: the second scan saw a matching
        // applied checksum
        assert_eq!(std::fs::read_to_string(&counter).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn skip_marker_shadows_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let plans = tmp.path().join("plans");
        std::fs::create_dir_all(&plans).unwrap();

        let marker = tmp.path().join("ran");
        let plan = serde_json::json!({
            "instructions": [{
                "name": "touch",
                "command": "touch",
                "args": [marker.to_str().unwrap()],
            }]
        });
        std::fs::write(plans.join("a.plan"), serde_json::to_vec(&plan).unwrap()).unwrap();
        std::fs::write(plans.join("a.plan.skip"), b"").unwrap();

        let w = watcher(tmp.path(), vec![plans.clone()]);
        let ctx = CancellationToken::new();
        w.scan_base(&ctx, &plans).await.unwrap();

        assert!(!marker.exists());
        assert!(!plans.join("a.pos").exists());
    }

    #[tokio::test]
    async fn broken_plan_does_not_abort_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let plans = tmp.path().join("plans");
        std::fs::create_dir_all(&plans).unwrap();

        std::fs::write(plans.join("a.plan"), b"{malformed").unwrap();
        let marker = tmp.path().join("sibling-ran");
        let plan = serde_json::json!({
            "instructions": [{
                "name": "touch",
                "command": "touch",
                "args": [marker.to_str().unwrap()],
            }]
        });
        std::fs::write(plans.join("b.plan"), serde_json::to_vec(&plan).unwrap()).unwrap();

        let w = watcher(tmp.path(), vec![plans.clone()]);
        let ctx = CancellationToken::new();
        w.scan_base(&ctx, &plans).await.unwrap();

        assert!(marker.exists());
    }

    #[tokio::test]
    async fn rewrites_position_only_when_changed() {
        let tmp = tempfile::tempdir().unwrap();
        let plans = tmp.path().join("plans");
        std::fs::create_dir_all(&plans).unwrap();
        std::fs::write(plans.join("a.plan"), b"{}").unwrap();

        let w = watcher(tmp.path(), vec![plans.clone()]);
        let ctx = CancellationToken::new();
        w.scan_base(&ctx, &plans).await.unwrap();

        let position_path = plans.join("a.pos");
        let first = std::fs::metadata(&position_path).unwrap().modified().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        w.scan_base(&ctx, &plans).await.unwrap();
        let second = std::fs::metadata(&position_path).unwrap().modified().unwrap();
        assert_eq!(first, second, "identical position bytes are not rewritten");
    }
}
