//! Instruction image staging.
//!
//! An instruction may name an OCI reference whose filesystem is staged into
//! the execution directory before the command runs. The agent side of that
//! seam is [`ImageStager`]; the in-repo [`Utility`] implementation stages
//! from pre-seeded tarballs under the configured images directory. Pulling
//! from a remote registry (and the credential-provider machinery the config
//! carries for it) belongs to external tooling behind the same seam.
//!
//! Tarball naming: an image reference is sanitised by replacing `/` and `:`
//! with `_`, and matched against `<sanitised>.tar`, `<sanitised>.tar.gz` or
//! `<sanitised>.tgz` anywhere under the images directory. Archive entries
//! are flattened to their base names, matching how staged instruction
//! bundles are laid out (`run.sh` and its helpers at the top level).

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("image {image:?} not available in local images directory")]
    NotAvailable { image: String },
    #[error("no images directory configured, cannot stage {image:?}")]
    NoImagesDir { image: String },
    #[error("failed to extract {image:?}: {source}")]
    Extract {
        image: String,
        source: std::io::Error,
    },
}

/// Populates a directory with an image's filesystem.
#[async_trait]
pub trait ImageStager: Send + Sync {
    async fn stage(&self, dir: &Path, image: &str) -> Result<(), StageError>;
}

/// Configuration handed through from the agent config file.
#[derive(Debug, Clone, Default)]
pub struct StagerConfig {
    pub images_dir: Option<PathBuf>,
    pub agent_registries_file: Option<PathBuf>,
    pub credential_provider_config: Option<PathBuf>,
    pub credential_provider_bin_dir: Option<PathBuf>,
}

/// Local-tarball image staging.
pub struct Utility {
    config: StagerConfig,
}

impl Utility {
    pub fn new(config: StagerConfig) -> Self {
        Utility { config }
    }

    fn find_tarball(&self, images_dir: &Path, image: &str) -> Option<PathBuf> {
        let sanitised = image.replace(['/', ':'], "_");
        let candidates = [
            format!("{sanitised}.tar"),
            format!("{sanitised}.tar.gz"),
            format!("{sanitised}.tgz"),
        ];
        for entry in WalkDir::new(images_dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if candidates.iter().any(|c| *c == name) {
                debug!(image, path = %entry.path().display(), "found local image tarball");
                return Some(entry.into_path());
            }
        }
        None
    }

    fn extract(&self, tarball: &Path, dest: &Path, image: &str) -> Result<(), StageError> {
        let wrap = |source: std::io::Error| StageError::Extract {
            image: image.to_string(),
            source,
        };

        // Extract through a sibling temp dir and move into place, so a
        // half-extracted archive never becomes an execution directory.
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(wrap)?;
        let staging = tempfile::tempdir_in(parent).map_err(wrap)?;

        let raw = fs::File::open(tarball).map_err(wrap)?;
        let gzipped = tarball
            .extension()
            .is_some_and(|ext| ext == "gz" || ext == "tgz");
        let reader: Box<dyn Read> = if gzipped {
            Box::new(GzDecoder::new(raw))
        } else {
            Box::new(raw)
        };

        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries().map_err(wrap)? {
            let mut entry = entry.map_err(wrap)?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let path = entry.path().map_err(wrap)?.into_owned();
            let Some(base) = path.file_name() else {
                continue;
            };
            debug!(image, file = %path.display(), "extracting");
            entry.unpack(staging.path().join(base)).map_err(wrap)?;
        }

        match fs::rename(staging.path(), dest) {
            Ok(()) => {
                // keep() so TempDir's drop does not remove the renamed tree
                let _ = staging.keep();
            }
            Err(_) => {
                // Destination already exists; move files into it one by one.
                for entry in fs::read_dir(staging.path()).map_err(wrap)? {
                    let entry = entry.map_err(wrap)?;
                    let target = dest.join(entry.file_name());
                    if target.exists() {
                        let _ = fs::remove_file(&target);
                    }
                    fs::rename(entry.path(), &target).map_err(wrap)?;
                }
            }
        }
        fs::set_permissions(dest, fs::Permissions::from_mode(0o755)).map_err(wrap)?;
        Ok(())
    }
}

#[async_trait]
impl ImageStager for Utility {
    async fn stage(&self, dir: &Path, image: &str) -> Result<(), StageError> {
        let Some(images_dir) = &self.config.images_dir else {
            return Err(StageError::NoImagesDir {
                image: image.to_string(),
            });
        };
        let Some(tarball) = self.find_tarball(images_dir, image) else {
            return Err(StageError::NotAvailable {
                image: image.to_string(),
            });
        };
        info!(image, dir = %dir.display(), "staging image from local tarball");
        self.extract(&tarball, dir, image)
    }
}
