use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::PutFileRequest;

/// Filesystem jail: workspace creation, path containment, file ops.
///
/// Guest paths such as `/docs/schema.md` are mapped under the workspace
/// root. This is NOT a chroot; it is path validation for the local-host
/// backend.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create a new jail rooted at `root`. Creates the directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    /// True while the workspace directory still exists on disk.
    pub fn is_alive(&self) -> bool {
        self.root.is_dir()
    }

    /// Resolve a guest path to an absolute host path, ensuring it stays
    /// inside the workspace root. Returns error on path traversal attempts.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let guest = Path::new(guest_path);

        let relative = if guest.is_absolute() {
            guest.strip_prefix("/").unwrap_or(guest)
        } else {
            guest
        };

        // Normalize without touching the filesystem so ".." is caught even
        // for paths that do not exist yet.
        let mut normalized = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::Exec(format!(
                            "path escapes workspace: {guest_path}"
                        )));
                    }
                }
                _ => {}
            }
        }

        // Canonical root keeps symlinked temp dirs (/var vs /private/var) consistent.
        let root_canonical = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());

        Ok(root_canonical.join(normalized))
    }

    pub fn put_file(&self, req: &PutFileRequest) -> Result<(), SandboxError> {
        let path = self.resolve(&req.path)?;
        if req.create_parents {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, &req.bytes)?;
        #[cfg(unix)]
        if let Some(mode) = req.mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    /// Remove a file or directory. Missing paths are not an error.
    pub fn remove_path(&self, guest_path: &str, recursive: bool) -> Result<(), SandboxError> {
        let path = self.resolve(guest_path)?;
        if !path.exists() {
            return Ok(());
        }
        if path.is_dir() {
            if recursive {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_dir(&path)?;
            }
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Remove the entire workspace directory.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
