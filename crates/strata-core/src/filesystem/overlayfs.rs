//! `OverlayFS` management for layered container filesystems.
//!
//! Stacks read-only layers with a single writable upper layer. The kernel
//! provides the copy-on-write semantics: first writes copy a lower file up,
//! deletes of lower paths leave whiteouts in the upper layer, and lower
//! layers are never modified.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use strata_common::constants::MAX_MOUNT_OPTIONS_LEN;
use strata_common::error::{ComposeFailure, Result, StrataError};
use strata_common::types::Layer;

/// Configuration for an `OverlayFS` mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Read-only lower layers (bottom to top).
    pub lower_dirs: Vec<PathBuf>,
    /// Writable upper layer directory.
    pub upper_dir: PathBuf,
    /// Work directory required by `OverlayFS`, on the same filesystem as `upper_dir`.
    pub work_dir: PathBuf,
    /// Final merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayConfig {
    /// Builds the `mount(2)` data string.
    ///
    /// `lowerdir` lists the topmost layer first, so the bottom-to-top
    /// `lower_dirs` are joined in reverse.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lowers = self
            .lower_dirs
            .iter()
            .rev()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        format!(
            "lowerdir={lowers},upperdir={},workdir={}",
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

/// What happens to the writable layer when a view is torn down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WritableLayer {
    /// Leave the writable layer on storage for inspection or reuse.
    #[default]
    Keep,
    /// Delete the writable and work directories.
    Discard,
}

/// Returns whether the running kernel lists `overlay` in `/proc/filesystems`.
///
/// A `false` result is not conclusive: the module may be auto-loaded on
/// the first mount.
#[must_use]
pub fn overlay_supported() -> bool {
    std::fs::read_to_string("/proc/filesystems").is_ok_and(|content| {
        content
            .lines()
            .any(|line| line.split_whitespace().last() == Some("overlay"))
    })
}

/// Mounts an `OverlayFS` with the given configuration.
///
/// # Errors
///
/// Returns [`StrataError::Privilege`] without `CAP_SYS_ADMIN`, and
/// [`StrataError::Compose`] if the option string is too long, the kernel or
/// backing filesystem lacks overlay support, or the mount fails otherwise.
pub fn mount_overlay(config: &OverlayConfig) -> Result<()> {
    let opts = config.mount_options();
    if opts.len() >= MAX_MOUNT_OPTIONS_LEN {
        return Err(StrataError::Compose {
            failure: ComposeFailure::MountFailed,
            message: format!(
                "overlay options for {} layers exceed {MAX_MOUNT_OPTIONS_LEN} bytes",
                config.lower_dirs.len()
            ),
        });
    }

    mount(
        Some("overlay"),
        &config.merged_dir,
        Some("overlay"),
        MsFlags::empty(),
        Some(opts.as_str()),
    )
    .map_err(|e| match e {
        Errno::EPERM | Errno::EACCES => StrataError::Privilege {
            message: format!("overlay mount at {} denied: {e}", config.merged_dir.display()),
        },
        Errno::EINVAL | Errno::ENODEV | Errno::EOPNOTSUPP => StrataError::Compose {
            failure: ComposeFailure::Unsupported,
            message: format!(
                "overlay mount at {} rejected by the kernel: {e}",
                config.merged_dir.display()
            ),
        },
        _ => StrataError::Compose {
            failure: ComposeFailure::MountFailed,
            message: format!("overlay mount at {}: {e}", config.merged_dir.display()),
        },
    })?;

    tracing::info!(
        merged = %config.merged_dir.display(),
        layers = config.lower_dirs.len(),
        "overlayfs mounted"
    );
    Ok(())
}

/// Unmounts an `OverlayFS` at the given path.
///
/// Uses `MNT_DETACH` to lazily detach the filesystem.
///
/// # Errors
///
/// Returns the `errno` of the failed `umount2(2)`.
pub fn unmount_overlay(merged_dir: &Path) -> nix::Result<()> {
    umount2(merged_dir, MntFlags::MNT_DETACH)?;
    tracing::info!(path = %merged_dir.display(), "overlayfs unmounted");
    Ok(())
}

/// Detaches a view left mounted by an earlier runtime process.
///
/// Succeeds if nothing is mounted at `merged_dir`.
///
/// # Errors
///
/// Returns an error if the unmount fails for another reason.
pub fn detach_stale(merged_dir: &Path) -> Result<()> {
    match unmount_overlay(merged_dir) {
        Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(e) => Err(StrataError::io(merged_dir, e.into())),
    }
}

/// A mounted union of read-only layers and one writable layer.
///
/// Owned by exactly one container. Dropping the view unmounts it and keeps
/// the writable layer; [`MergedView::teardown`] reports errors and can
/// discard the writable layer.
#[derive(Debug)]
pub struct MergedView {
    config: OverlayConfig,
    mounted: AtomicBool,
}

impl MergedView {
    /// The directory presenting the merged tree.
    #[must_use]
    pub fn merged_dir(&self) -> &Path {
        &self.config.merged_dir
    }

    /// The writable layer.
    #[must_use]
    pub fn upper_dir(&self) -> &Path {
        &self.config.upper_dir
    }

    /// Read-only layers, bottom to top.
    #[must_use]
    pub fn lower_dirs(&self) -> &[PathBuf] {
        &self.config.lower_dirs
    }

    /// Returns whether the view is still mounted.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Unmounts the view and optionally discards the writable layer.
    ///
    /// Idempotent: a second call only applies `mode`. Lower layers are
    /// never touched.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Internal`] if the view was believed mounted but
    /// the kernel reports nothing there, and an I/O error if unmounting or
    /// deleting the writable layer fails.
    pub fn teardown(&self, mode: WritableLayer) -> Result<()> {
        if self.is_mounted() {
            match unmount_overlay(&self.config.merged_dir) {
                Ok(()) => {}
                Err(e @ (Errno::EINVAL | Errno::ENOENT)) => {
                    self.mounted.store(false, Ordering::Release);
                    return Err(StrataError::Internal {
                        message: format!(
                            "merged view {} was already unmounted: {e}",
                            self.config.merged_dir.display()
                        ),
                    });
                }
                Err(e) => return Err(StrataError::io(&self.config.merged_dir, e.into())),
            }
            self.mounted.store(false, Ordering::Release);
        }

        if mode == WritableLayer::Discard {
            for dir in [&self.config.upper_dir, &self.config.work_dir] {
                match std::fs::remove_dir_all(dir) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StrataError::io(dir, e)),
                }
            }
            tracing::info!(upper = %self.config.upper_dir.display(), "writable layer discarded");
        }
        Ok(())
    }
}

impl Drop for MergedView {
    fn drop(&mut self) {
        if self.is_mounted() {
            if let Err(e) = self.teardown(WritableLayer::Keep) {
                tracing::warn!(
                    merged = %self.config.merged_dir.display(),
                    error = %e,
                    "failed to unmount merged view"
                );
            }
        }
    }
}

/// Composes `layers` (lowest precedence first) and a writable layer into a
/// mounted view at `merged_dir`.
///
/// `upper_dir` and `work_dir` are created if missing and must otherwise be
/// empty. Nothing is mounted if a check fails.
///
/// # Errors
///
/// Returns [`StrataError::Compose`] if a layer is missing or unreadable, the
/// writable layer is not empty, or the mount fails, and
/// [`StrataError::Privilege`] without mount privilege.
pub fn compose_view(
    layers: &[Layer],
    upper_dir: &Path,
    work_dir: &Path,
    merged_dir: &Path,
) -> Result<MergedView> {
    for layer in layers {
        check_layer(layer)?;
    }
    for dir in [upper_dir, work_dir] {
        ensure_empty_dir(dir)?;
    }
    std::fs::create_dir_all(merged_dir).map_err(|e| StrataError::io(merged_dir, e))?;

    let config = OverlayConfig {
        lower_dirs: layers.iter().map(|l| l.path.clone()).collect(),
        upper_dir: upper_dir.to_path_buf(),
        work_dir: work_dir.to_path_buf(),
        merged_dir: merged_dir.to_path_buf(),
    };
    mount_overlay(&config)?;
    Ok(MergedView {
        config,
        mounted: AtomicBool::new(true),
    })
}

fn check_layer(layer: &Layer) -> Result<()> {
    let missing = |detail: String| StrataError::Compose {
        failure: ComposeFailure::LayerMissing,
        message: format!("layer {} at {}: {detail}", layer.id, layer.path.display()),
    };
    let meta = std::fs::metadata(&layer.path).map_err(|e| match e.kind() {
        ErrorKind::PermissionDenied => StrataError::Compose {
            failure: ComposeFailure::LayerUnreadable,
            message: format!("layer {} at {}: {e}", layer.id, layer.path.display()),
        },
        _ => missing(e.to_string()),
    })?;
    if !meta.is_dir() {
        return Err(missing("not a directory".into()));
    }
    std::fs::read_dir(&layer.path)
        .map(drop)
        .map_err(|e| StrataError::Compose {
            failure: ComposeFailure::LayerUnreadable,
            message: format!("layer {} at {}: {e}", layer.id, layer.path.display()),
        })
}

fn ensure_empty_dir(dir: &Path) -> Result<()> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(StrataError::Compose {
                    failure: ComposeFailure::WritableNotEmpty,
                    message: format!("{} is not empty", dir.display()),
                });
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            std::fs::create_dir_all(dir).map_err(|e| StrataError::io(dir, e))
        }
        Err(e) if e.kind() == ErrorKind::NotADirectory => Err(StrataError::Compose {
            failure: ComposeFailure::WritableNotEmpty,
            message: format!("{} is not a directory", dir.display()),
        }),
        Err(e) => Err(StrataError::io(dir, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowerdir_lists_topmost_layer_first() {
        let config = OverlayConfig {
            lower_dirs: vec!["/layers/base".into(), "/layers/app".into()],
            upper_dir: "/c/upper".into(),
            work_dir: "/c/work".into(),
            merged_dir: "/c/merged".into(),
        };
        assert_eq!(
            config.mount_options(),
            "lowerdir=/layers/app:/layers/base,upperdir=/c/upper,workdir=/c/work"
        );
    }

    #[test]
    fn missing_layer_fails_before_mounting() {
        let dir = tempfile::tempdir().unwrap();
        let layers = [Layer::new("base", dir.path().join("absent"))];
        let err = compose_view(
            &layers,
            &dir.path().join("upper"),
            &dir.path().join("work"),
            &dir.path().join("merged"),
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                StrataError::Compose {
                    failure: ComposeFailure::LayerMissing,
                    ..
                }
            ),
            "{err}"
        );
        assert!(!dir.path().join("merged").exists());
    }

    #[test]
    fn file_layer_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("layer.tar");
        std::fs::write(&file, b"not a dir").unwrap();
        let err = check_layer(&Layer::new("base", file)).unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{err}");
    }

    #[test]
    fn non_empty_writable_layer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("upper");
        std::fs::create_dir(&upper).unwrap();
        std::fs::write(upper.join("stale"), b"x").unwrap();
        let err = ensure_empty_dir(&upper).unwrap_err();
        assert!(matches!(
            err,
            StrataError::Compose {
                failure: ComposeFailure::WritableNotEmpty,
                ..
            }
        ));
    }

    #[test]
    fn missing_writable_layer_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("nested/upper");
        ensure_empty_dir(&upper).unwrap();
        assert!(upper.is_dir());
    }

    #[test]
    fn teardown_of_unmounted_view_can_discard() {
        let dir = tempfile::tempdir().unwrap();
        let upper = dir.path().join("upper");
        let work = dir.path().join("work");
        std::fs::create_dir(&upper).unwrap();
        std::fs::create_dir(&work).unwrap();
        std::fs::write(upper.join("x"), b"data").unwrap();
        let view = MergedView {
            config: OverlayConfig {
                lower_dirs: vec![],
                upper_dir: upper.clone(),
                work_dir: work.clone(),
                merged_dir: dir.path().join("merged"),
            },
            mounted: AtomicBool::new(false),
        };
        view.teardown(WritableLayer::Keep).unwrap();
        assert!(upper.join("x").exists());
        view.teardown(WritableLayer::Discard).unwrap();
        view.teardown(WritableLayer::Discard).unwrap();
        assert!(!upper.exists());
        assert!(!work.exists());
    }
}
