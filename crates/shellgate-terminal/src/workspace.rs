//! Workspace directories and the path guard that keeps file access inside
//! them.

use shellgate_types::GateError;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

/// Validates paths against one workspace root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceGuard {
    root: PathBuf,
}

impl WorkspaceGuard {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, GateError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            GateError::Configuration(format!("workspace root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (absolute, or relative to the root) and make sure it
    /// stays inside the root, following symlinks for the parts that exist.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, GateError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let resolved = resolve_existing_prefix(&normalize(&joined));

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(GateError::AccessDenied {
                path: path.to_path_buf(),
                root: self.root.clone(),
            })
        }
    }

    /// Like [`resolve`](Self::resolve) but returns the path relative to the
    /// root
    pub fn relative(&self, path: &Path) -> Result<PathBuf, GateError> {
        let resolved = self.resolve(path)?;
        Ok(resolved
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_default())
    }
}

/// Lexically remove `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and append the rest
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// Session ids become directory names; keep them to a safe alphabet
fn directory_name(session_id: &str) -> String {
    let name: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "session".to_string()
    } else {
        name
    }
}

/// Hands out per-session workspace directories under the allowed roots
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    default_root: PathBuf,
}

impl WorkspaceAllocator {
    /// `default_root` is used when the policy names no allowed roots
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: default_root.into(),
        }
    }

    pub fn default_root(&self) -> &Path {
        &self.default_root
    }

    fn roots(&self, allowed: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
        if allowed.is_empty() {
            vec![self.default_root.clone()]
        } else {
            allowed.iter().cloned().collect()
        }
    }

    /// Create the workspace for `session_id`.
    ///
    /// A requested directory must fall under one of the allowed roots;
    /// otherwise the session gets `<first root>/<session id>`.
    pub fn allocate(
        &self,
        allowed: &BTreeSet<PathBuf>,
        session_id: &str,
        requested: Option<&Path>,
    ) -> Result<PathBuf, GateError> {
        let roots = self.roots(allowed);
        let first = roots
            .first()
            .ok_or_else(|| GateError::Configuration("no workspace root configured".to_string()))?;

        let target = match requested {
            Some(path) => {
                let mut denied = None;
                let mut found = None;
                for root in &roots {
                    std::fs::create_dir_all(root).map_err(|e| create_failed(root, e))?;
                    match WorkspaceGuard::new(root)?.resolve(path) {
                        Ok(resolved) => {
                            found = Some(resolved);
                            break;
                        }
                        Err(e) => denied = Some(e),
                    }
                }
                match (found, denied) {
                    (Some(resolved), _) => resolved,
                    (None, Some(err)) => return Err(err),
                    (None, None) => return Err(GateError::Configuration("no workspace root configured".to_string())),
                }
            }
            None => {
                std::fs::create_dir_all(first).map_err(|e| create_failed(first, e))?;
                WorkspaceGuard::new(first)?
                    .root()
                    .join(directory_name(session_id))
            }
        };

        std::fs::create_dir_all(&target).map_err(|e| create_failed(&target, e))?;
        tracing::debug!(session_id, workspace = %target.display(), "workspace allocated");
        Ok(target)
    }

    /// Release a workspace, deleting it only when `remove` is set and it is
    /// strictly inside an allowed root
    pub fn release(&self, allowed: &BTreeSet<PathBuf>, workspace: &Path, remove: bool) -> Result<(), GateError> {
        if !remove || !workspace.exists() {
            return Ok(());
        }
        let inside = self.roots(allowed).iter().any(|root| {
            WorkspaceGuard::new(root)
                .and_then(|guard| guard.resolve(workspace))
                .map(|resolved| resolved != guard_root(root))
                .unwrap_or(false)
        });
        if !inside {
            tracing::warn!(workspace = %workspace.display(), "refusing to remove workspace outside allowed roots");
            return Ok(());
        }
        std::fs::remove_dir_all(workspace).map_err(|e| {
            GateError::Configuration(format!("failed to remove workspace {}: {}", workspace.display(), e))
        })
    }
}

fn guard_root(root: &Path) -> PathBuf {
    root.canonicalize().unwrap_or_else(|_| root.to_path_buf())
}

fn create_failed(path: &Path, err: std::io::Error) -> GateError {
    GateError::BackendCreateFailed(format!("cannot create workspace {}: {}", path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_inside_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let guard = WorkspaceGuard::new(dir.path()).unwrap();

        let resolved = guard.resolve(Path::new("src/../src/main.rs")).unwrap();
        assert_eq!(resolved, guard.root().join("src/main.rs"));
        assert_eq!(guard.relative(Path::new("src")).unwrap(), PathBuf::from("src"));
        assert_eq!(guard.relative(Path::new(".")).unwrap(), PathBuf::new());
    }

    #[test]
    fn test_escape_denied() {
        let dir = TempDir::new().unwrap();
        let guard = WorkspaceGuard::new(dir.path()).unwrap();

        for path in ["../outside", "/etc/passwd", "src/../../x"] {
            let err = guard.resolve(Path::new(path)).unwrap_err();
            assert!(matches!(err, GateError::AccessDenied { .. }), "{}", path);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_denied() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let guard = WorkspaceGuard::new(dir.path()).unwrap();

        assert!(guard.resolve(Path::new("link/file")).is_err());
    }

    #[test]
    fn test_allocate_default_and_requested() {
        let dir = TempDir::new().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path().join("ws"));
        let none = BTreeSet::new();

        let path = allocator.allocate(&none, "../../evil", None).unwrap();
        assert!(path.is_dir());
        assert!(path.starts_with(dir.path().join("ws").canonicalize().unwrap()));
        assert!(path.ends_with("______evil"));

        let requested = dir.path().join("ws").join("project");
        let path = allocator.allocate(&none, "s2", Some(&requested)).unwrap();
        assert!(path.ends_with("project"));

        let err = allocator
            .allocate(&none, "s3", Some(Path::new("/etc")))
            .unwrap_err();
        assert!(matches!(err, GateError::AccessDenied { .. }));
    }

    #[test]
    fn test_allowed_roots_override_default() {
        let dir = TempDir::new().unwrap();
        let allowed_root = dir.path().join("allowed");
        let allocator = WorkspaceAllocator::new(dir.path().join("default"));
        let allowed: BTreeSet<PathBuf> = [allowed_root.clone()].into_iter().collect();

        let path = allocator.allocate(&allowed, "s1", None).unwrap();
        assert!(path.starts_with(allowed_root.canonicalize().unwrap()));
        assert!(!dir.path().join("default").exists());
    }

    #[test]
    fn test_release_keeps_by_default() {
        let dir = TempDir::new().unwrap();
        let allocator = WorkspaceAllocator::new(dir.path());
        let none = BTreeSet::new();
        let path = allocator.allocate(&none, "s1", None).unwrap();

        allocator.release(&none, &path, false).unwrap();
        assert!(path.exists());
        allocator.release(&none, &path, true).unwrap();
        assert!(!path.exists());

        // the root itself is never removed
        allocator.release(&none, dir.path(), true).unwrap();
        assert!(dir.path().exists());
    }
}
