//! Root-directory confinement of resolved source paths.
//!
//! Paths are normalized lexically so an untrusted path is rejected before
//! anything touches the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;

/// Where sources may be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootPolicy {
    /// Sources must normalize to a path under this directory. Relative
    /// sources are taken relative to it.
    Confined(PathBuf),
    /// No confinement. Relative sources are taken relative to the working
    /// directory.
    Unrestricted,
}

impl RootPolicy {
    pub fn confined(root: impl AsRef<Path>) -> Self {
        RootPolicy::Confined(absolute(root.as_ref()))
    }

    pub fn root(&self) -> Option<&Path> {
        match self {
            RootPolicy::Confined(root) => Some(root),
            RootPolicy::Unrestricted => None,
        }
    }

    /// Normalize `path` and check it against the policy.
    pub fn confine(&self, path: &Path) -> Result<PathBuf, ProtocolError> {
        match self {
            RootPolicy::Confined(root) => {
                let resolved = normalize(&root.join(path));
                if resolved.starts_with(root) {
                    Ok(resolved)
                } else {
                    Err(ProtocolError::PathEscape {
                        path: resolved,
                        root: root.clone(),
                    })
                }
            }
            RootPolicy::Unrestricted => Ok(normalize(&absolute(path))),
        }
    }
}

/// Make `path` absolute against the working directory and normalize it.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize(&cwd.join(path))
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the filesystem root stays at the root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let at_root = matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                );
                if !at_root {
                    out.pop();
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
