//! Userspace model of overlay read resolution.
//!
//! Lets the runtime answer "which layer does this path come from" and
//! "what did this container change" without mounting anything, so a
//! stopped container's writable layer can be inspected.
//!
//! The rules mirror the kernel's: a lookup walks the path one component at
//! a time from the top layer down. A whiteout (a `0:0` character device)
//! hides the name in every lower layer. A directory marked opaque
//! (`trusted.overlay.opaque` or `user.overlay.opaque` set to `y`) hides the
//! lower layers' directories of the same name. A non-directory hides
//! everything beneath it.

use std::ffi::{CStr, CString};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use strata_common::error::{Result, StrataError};

/// Extended attributes marking an opaque directory.
const OPAQUE_XATTRS: [&CStr; 2] = [c"trusted.overlay.opaque", c"user.overlay.opaque"];

/// A layer in a [`LayerStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerRef {
    /// The writable layer.
    Upper,
    /// A read-only layer, by index in bottom-to-top order.
    Lower(usize),
}

/// Outcome of resolving one path through a [`LayerStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The path resolves to `path`, inside `layer`.
    Found {
        /// Layer providing the visible entry.
        layer: LayerRef,
        /// Host path of the visible entry.
        path: PathBuf,
    },
    /// A whiteout in `layer` hides the path (or one of its parents).
    Whiteout {
        /// Layer holding the whiteout.
        layer: LayerRef,
    },
    /// No layer provides the path.
    NotFound,
}

impl Lookup {
    /// Returns whether the path is visible in the merged tree.
    #[must_use]
    pub const fn is_found(&self) -> bool {
        matches!(self, Self::Found { .. })
    }
}

/// How a path differs between the read-only layers and the merged tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    /// The path exists only in the writable layer.
    Added,
    /// The writable layer replaces a path from a read-only layer.
    Modified,
    /// The writable layer hides a path from a read-only layer.
    Deleted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Added => "A",
            Self::Modified => "C",
            Self::Deleted => "D",
        })
    }
}

/// One entry of a writable-layer diff.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Change {
    /// Path relative to the container root.
    pub path: PathBuf,
    /// Kind of change.
    pub kind: ChangeKind,
}

/// Read-only layers (bottom to top) with an optional writable layer on top.
#[derive(Debug, Clone)]
pub struct LayerStack {
    lowers: Vec<PathBuf>,
    upper: Option<PathBuf>,
}

/// What one layer holds at a given name.
enum Entry {
    Missing,
    Whiteout,
    Dir { opaque: bool },
    Other,
}

impl LayerStack {
    /// Creates a stack from read-only layers, lowest precedence first.
    #[must_use]
    pub const fn new(lowers: Vec<PathBuf>, upper: Option<PathBuf>) -> Self {
        Self { lowers, upper }
    }

    /// Layers in precedence order, highest first.
    fn top_down(&self) -> Vec<(LayerRef, &Path)> {
        let upper = self.upper.as_deref().map(|p| (LayerRef::Upper, p));
        let lowers = self
            .lowers
            .iter()
            .enumerate()
            .rev()
            .map(|(i, p)| (LayerRef::Lower(i), p.as_path()));
        upper.into_iter().chain(lowers).collect()
    }

    /// Resolves `path` (relative to the container root) the way the merged view would.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Validation`] if the path contains `..`, and an
    /// I/O error if a layer entry cannot be inspected.
    pub fn lookup(&self, path: &Path) -> Result<Lookup> {
        let components = normalize(path)?;
        let layers = self.top_down();
        if components.as_os_str().is_empty() {
            return Ok(layers.first().map_or(Lookup::NotFound, |(layer, root)| {
                Lookup::Found {
                    layer: *layer,
                    path: root.to_path_buf(),
                }
            }));
        }

        // Layers whose copy of the current parent directory is visible.
        let mut visible = layers;
        let mut prefix = PathBuf::new();
        let count = components.components().count();

        for (depth, name) in components.components().enumerate() {
            prefix.push(name);
            let is_last = depth + 1 == count;
            let mut dirs = Vec::new();

            for (layer, root) in &visible {
                let candidate = root.join(&prefix);
                match inspect(&candidate)? {
                    Entry::Missing => {}
                    Entry::Whiteout => {
                        if dirs.is_empty() {
                            return Ok(Lookup::Whiteout { layer: *layer });
                        }
                        break;
                    }
                    Entry::Other => {
                        if dirs.is_empty() {
                            return Ok(if is_last {
                                Lookup::Found {
                                    layer: *layer,
                                    path: candidate,
                                }
                            } else {
                                Lookup::NotFound
                            });
                        }
                        break;
                    }
                    Entry::Dir { opaque } => {
                        dirs.push((*layer, *root));
                        if opaque {
                            break;
                        }
                    }
                }
            }

            let Some((top, root)) = dirs.first().copied() else {
                return Ok(Lookup::NotFound);
            };
            if is_last {
                return Ok(Lookup::Found {
                    layer: top,
                    path: root.join(&prefix),
                });
            }
            visible = dirs;
        }
        Ok(Lookup::NotFound)
    }
}

/// Lists what the writable layer `upper` changes relative to `lowers`.
///
/// Directories that merely contain changes are not listed themselves.
/// The result is sorted by path.
///
/// # Errors
///
/// Returns an I/O error if the writable layer cannot be walked.
pub fn changes(lowers: &[PathBuf], upper: &Path) -> Result<Vec<Change>> {
    let base = LayerStack::new(lowers.to_vec(), None);
    let mut out = Vec::new();
    walk_upper(&base, upper, Path::new(""), &mut out)?;
    out.sort();
    Ok(out)
}

fn walk_upper(base: &LayerStack, upper: &Path, rel: &Path, out: &mut Vec<Change>) -> Result<()> {
    let dir = upper.join(rel);
    let entries = std::fs::read_dir(&dir).map_err(|e| StrataError::io(&dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| StrataError::io(&dir, e))?;
        let path = rel.join(entry.file_name());
        let below = base.lookup(&path)?;
        match inspect(&entry.path())? {
            Entry::Missing => {}
            Entry::Whiteout => {
                if below.is_found() {
                    out.push(Change {
                        path,
                        kind: ChangeKind::Deleted,
                    });
                }
            }
            Entry::Dir { opaque } => {
                let lower_is_dir = matches!(&below, Lookup::Found { path: p, .. } if p.is_dir());
                if !lower_is_dir {
                    out.push(Change {
                        path: path.clone(),
                        kind: if below.is_found() {
                            ChangeKind::Modified
                        } else {
                            ChangeKind::Added
                        },
                    });
                } else if opaque {
                    out.push(Change {
                        path: path.clone(),
                        kind: ChangeKind::Modified,
                    });
                }
                walk_upper(base, upper, &path, out)?;
            }
            Entry::Other => out.push(Change {
                kind: if below.is_found() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                },
                path,
            }),
        }
    }
    Ok(())
}

/// Strips root and `.` components and rejects `..`.
fn normalize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(StrataError::Validation {
                    message: format!("path must not escape the container root: {}", path.display()),
                });
            }
        }
    }
    Ok(out)
}

fn inspect(path: &Path) -> Result<Entry> {
    let meta: Metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
            return Ok(Entry::Missing);
        }
        Err(e) => return Err(StrataError::io(path, e)),
    };
    let file_type = meta.file_type();
    Ok(if file_type.is_char_device() && meta.rdev() == 0 {
        Entry::Whiteout
    } else if file_type.is_dir() {
        Entry::Dir {
            opaque: is_opaque(path),
        }
    } else {
        Entry::Other
    })
}

#[allow(unsafe_code)]
fn is_opaque(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    OPAQUE_XATTRS.iter().any(|name| {
        let mut value = [0_u8; 2];
        // SAFETY: both strings are NUL-terminated and `value` is writable for its full length.
        let len = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                name.as_ptr(),
                value.as_mut_ptr().cast(),
                value.len(),
            )
        };
        len == 1 && value[0] == b'y'
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        base: PathBuf,
        app: PathBuf,
        upper: PathBuf,
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let app = dir.path().join("app");
        let upper = dir.path().join("upper");
        write(&base.join("etc/os-release"), "base");
        write(&base.join("usr/lib/libc.so"), "libc");
        write(&base.join("opt/tool/bin/run"), "tool");
        write(&app.join("etc/os-release"), "app");
        write(&app.join("usr/bin/app"), "app-bin");
        write(&app.join("opt/tool"), "now a file");
        std::fs::create_dir_all(&upper).unwrap();
        Fixture {
            _dir: dir,
            base,
            app,
            upper,
        }
    }

    fn stack(f: &Fixture) -> LayerStack {
        LayerStack::new(vec![f.base.clone(), f.app.clone()], Some(f.upper.clone()))
    }

    /// Creates a kernel-style whiteout, or returns `false` without `CAP_MKNOD`.
    fn make_whiteout(path: &Path) -> bool {
        use nix::sys::stat::{Mode, SFlag, mknod};
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        mknod(path, SFlag::S_IFCHR, Mode::empty(), 0).is_ok()
    }

    #[test]
    fn highest_layer_wins() {
        let f = fixture();
        let found = stack(&f).lookup(Path::new("/etc/os-release")).unwrap();
        assert_eq!(
            found,
            Lookup::Found {
                layer: LayerRef::Lower(1),
                path: f.app.join("etc/os-release"),
            }
        );

        write(&f.upper.join("etc/os-release"), "mine");
        let found = stack(&f).lookup(Path::new("etc/os-release")).unwrap();
        assert!(matches!(found, Lookup::Found { layer: LayerRef::Upper, .. }));
    }

    #[test]
    fn directories_merge_across_layers() {
        let f = fixture();
        let s = stack(&f);
        assert!(matches!(
            s.lookup(Path::new("usr/lib/libc.so")).unwrap(),
            Lookup::Found { layer: LayerRef::Lower(0), .. }
        ));
        assert!(matches!(
            s.lookup(Path::new("usr/bin/app")).unwrap(),
            Lookup::Found { layer: LayerRef::Lower(1), .. }
        ));
    }

    #[test]
    fn file_shadows_lower_directory() {
        let f = fixture();
        let s = stack(&f);
        assert!(matches!(
            s.lookup(Path::new("opt/tool")).unwrap(),
            Lookup::Found { layer: LayerRef::Lower(1), .. }
        ));
        assert_eq!(s.lookup(Path::new("opt/tool/bin/run")).unwrap(), Lookup::NotFound);
    }

    #[test]
    fn missing_path_is_not_found() {
        let f = fixture();
        assert_eq!(
            stack(&f).lookup(Path::new("var/log/none")).unwrap(),
            Lookup::NotFound
        );
    }

    #[test]
    fn parent_components_are_rejected() {
        let f = fixture();
        let err = stack(&f).lookup(Path::new("etc/../../host")).unwrap_err();
        assert!(matches!(err, StrataError::Validation { .. }));
    }

    #[test]
    fn whiteout_hides_lower_entry() {
        let f = fixture();
        if !make_whiteout(&f.upper.join("usr/lib/libc.so")) {
            eprintln!("skipping: mknod requires CAP_MKNOD");
            return;
        }
        let s = stack(&f);
        assert_eq!(
            s.lookup(Path::new("usr/lib/libc.so")).unwrap(),
            Lookup::Whiteout {
                layer: LayerRef::Upper
            }
        );
        // The read-only layer still has it.
        assert!(f.base.join("usr/lib/libc.so").exists());

        let diff = changes(&[f.base.clone(), f.app.clone()], &f.upper).unwrap();
        assert_eq!(
            diff,
            vec![Change {
                path: PathBuf::from("usr/lib/libc.so"),
                kind: ChangeKind::Deleted,
            }]
        );
    }

    #[test]
    fn changes_list_added_and_modified() {
        let f = fixture();
        write(&f.upper.join("etc/os-release"), "mine");
        write(&f.upper.join("data/new.txt"), "hello");
        let diff = changes(&[f.base.clone(), f.app.clone()], &f.upper).unwrap();
        assert_eq!(
            diff,
            vec![
                Change {
                    path: PathBuf::from("data"),
                    kind: ChangeKind::Added,
                },
                Change {
                    path: PathBuf::from("data/new.txt"),
                    kind: ChangeKind::Added,
                },
                Change {
                    path: PathBuf::from("etc/os-release"),
                    kind: ChangeKind::Modified,
                },
            ]
        );
    }

    #[test]
    fn empty_writable_layer_has_no_changes() {
        let f = fixture();
        assert!(changes(&[f.base.clone()], &f.upper).unwrap().is_empty());
    }
}
