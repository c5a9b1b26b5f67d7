//! Path resolution for the local sandbox.
//!
//! Every caller-supplied path must land inside the sandbox root. Relative
//! paths are joined onto the root. Absolute paths that already point inside
//! the root (the common case of an agent echoing back a path we handed out)
//! are used as-is; absolute paths pointing elsewhere are downgraded to
//! relative and re-resolved under the root, so an escape attempt via
//! `/etc/passwd` lands at `<root>/etc/passwd` instead of the host file.
//!
//! `..` traversal is the one case that must fail loudly: collapsing parent
//! segments can defeat any prefix check, so a path that would walk above
//! the root is rejected with [`SandboxError::PathTraversal`].
//!
//! Resolution is purely lexical. The root is expected to be canonicalized
//! by the caller (the local backend canonicalizes it at provisioning time),
//! which also covers platforms where the temp directory is a symlink.

use std::path::{Component, Path, PathBuf};

use super::error::SandboxError;

/// Resolves `requested` against `root`, guaranteeing containment.
///
/// Returns the resolved absolute path, or `PathTraversal` if `..` segments
/// would escape the root.
pub(crate) fn resolve_path(root: &Path, requested: &str) -> Result<PathBuf, SandboxError> {
    let requested_path = Path::new(requested);

    if requested_path.is_absolute() {
        let normalized = normalize_absolute(requested_path);
        if normalized.starts_with(root) {
            return Ok(normalized);
        }

        // Absolute but outside the sandbox: strip the leading separator and
        // re-resolve under the root. Parent segments were already collapsed
        // against the filesystem root above, so only normal components remain.
        let relative: PathBuf = normalized
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        return contain(root, &relative, requested);
    }

    contain(root, requested_path, requested)
}

/// Lexically normalizes an absolute path: collapses `.` and `..` segments
/// without touching the filesystem. `..` at the filesystem root is clamped.
fn normalize_absolute(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = normalized.pop();
                // Never pop past the root itself.
                if !popped || normalized.as_os_str().is_empty() {
                    normalized = PathBuf::from(std::path::MAIN_SEPARATOR_STR);
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// Joins a relative path onto `root`, rejecting any `..` that would climb
/// above it. `original` is the caller-supplied string, used for the error.
fn contain(root: &Path, relative: &Path, original: &str) -> Result<PathBuf, SandboxError> {
    let mut resolved = root.to_path_buf();
    let mut depth: usize = 0;

    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(SandboxError::path_traversal(original));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::CurDir => {}
            // A relative path cannot legitimately contain these.
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::path_traversal(original));
            }
        }
    }

    Ok(resolved)
}
