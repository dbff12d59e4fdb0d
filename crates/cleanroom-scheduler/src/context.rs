//! Build context assembly.
//!
//! The creator's workspace archive is unpacked into a scratch directory, the
//! platform Dockerfile and config are dropped next to it, and the result is
//! repacked as a tar stream for the image builder.

use cleanroom_core::{Error, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType};
use tracing::debug;

/// File names the builder expects at the root of the context.
pub const DOCKERFILE_NAME: &str = "Dockerfile";
pub const CONFIG_NAME: &str = "config.yaml";

fn bad_archive(message: impl Into<String>) -> Error {
    Error::InvalidInput(format!("workspace archive: {}", message.into()))
}

fn io_error(action: &str, err: std::io::Error) -> Error {
    Error::Internal(format!("{}: {}", action, err))
}

/// Relative, `..`-free form of an archive path, or `None` if it is absolute
/// or climbs out of its root.
fn contained(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

/// Whether `target`, interpreted relative to `base` inside the archive root,
/// stays inside that root.
fn stays_inside(base: &Path, target: &Path) -> bool {
    let mut depth: Vec<&std::ffi::OsStr> = Vec::new();
    for component in base.components().chain(target.components()) {
        match component {
            Component::Normal(part) => depth.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth.pop().is_none() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Unpack a gzip-compressed tar archive into `dest`, refusing any entry that
/// would land outside it. Returns the number of entries written.
pub fn unpack_workspace(archive: &[u8], dest: &Path) -> Result<usize> {
    let mut archive = Archive::new(GzDecoder::new(archive));
    archive.set_preserve_permissions(false);
    #[cfg(unix)]
    archive.set_unpack_xattrs(false);

    let entries = archive
        .entries()
        .map_err(|e| bad_archive(format!("unreadable: {}", e)))?;

    let mut count = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| bad_archive(format!("bad entry: {}", e)))?;
        let raw_path = entry
            .path()
            .map_err(|e| bad_archive(format!("bad path: {}", e)))?
            .into_owned();
        let path = contained(&raw_path)
            .ok_or_else(|| bad_archive(format!("entry {} escapes the workspace", raw_path.display())))?;

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous | EntryType::Directory => {}
            kind @ (EntryType::Symlink | EntryType::Link) => {
                let target = entry
                    .link_name()
                    .map_err(|e| bad_archive(format!("bad link target: {}", e)))?
                    .ok_or_else(|| bad_archive(format!("link {} has no target", path.display())))?
                    .into_owned();
                // Symlinks resolve from their own directory, hard links from the root.
                let base = if kind == EntryType::Symlink {
                    path.parent().map(Path::to_path_buf).unwrap_or_default()
                } else {
                    PathBuf::new()
                };
                if !stays_inside(&base, &target) {
                    return Err(bad_archive(format!(
                        "link {} points outside the workspace",
                        path.display()
                    )));
                }
            }
            other => {
                return Err(bad_archive(format!(
                    "unsupported entry type {:?} at {}",
                    other,
                    path.display()
                )));
            }
        }

        let written = entry
            .unpack_in(dest)
            .map_err(|e| bad_archive(format!("cannot unpack {}: {}", path.display(), e)))?;
        if !written {
            return Err(bad_archive(format!(
                "entry {} escapes the workspace",
                path.display()
            )));
        }
        count += 1;
    }

    Ok(count)
}

/// Paths of the files injected into every build context.
#[derive(Debug, Clone)]
pub struct ContextFiles {
    pub dockerfile: PathBuf,
    pub config_file: PathBuf,
}

/// Produce an uncompressed tar of the workspace plus the injected files.
///
/// Scratch space is a fresh directory under `scratch_dir`, removed before
/// returning.
pub fn assemble_build_context(
    workspace: &[u8],
    scratch_dir: &Path,
    files: &ContextFiles,
) -> Result<Vec<u8>> {
    fs::create_dir_all(scratch_dir).map_err(|e| io_error("create scratch directory", e))?;
    let scratch = tempfile::Builder::new()
        .prefix("context-")
        .tempdir_in(scratch_dir)
        .map_err(|e| io_error("create scratch directory", e))?;

    let entries = unpack_workspace(workspace, scratch.path())?;
    debug!(entries, dir = %scratch.path().display(), "Unpacked workspace");

    fs::copy(&files.dockerfile, scratch.path().join(DOCKERFILE_NAME))
        .map_err(|e| io_error("copy Dockerfile", e))?;
    fs::copy(&files.config_file, scratch.path().join(CONFIG_NAME))
        .map_err(|e| io_error("copy build config", e))?;

    let mut builder = Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", scratch.path())
        .map_err(|e| io_error("package build context", e))?;
    let tarball = builder
        .into_inner()
        .map_err(|e| io_error("package build context", e))?;

    scratch
        .close()
        .map_err(|e| io_error("remove scratch directory", e))?;
    Ok(tarball)
}
