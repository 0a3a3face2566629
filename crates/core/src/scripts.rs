//! Read-only view of the scripts directory.
//!
//! Maps a hook name (URL path segments joined by `/`) to a script below the
//! configured root. A name resolves to `<root>/<segments>.sh` when that file
//! exists; otherwise to an executable `<root>/<segments>.<ext>`, the first
//! extension in alphabetical order winning. The resolved path is
//! canonicalized and must stay below the (canonical) root, so neither `..`
//! segments nor symlinks can escape it.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::error::HookError;

const PREFERRED_EXTENSION: &str = "sh";

#[derive(Debug, Clone)]
pub struct ScriptsDir {
    root: PathBuf,
}

impl ScriptsDir {
    /// Open the view. Fails if `root` does not exist.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    /// Canonical root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a hook name to the canonical path of its script.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, HookError> {
        let not_found = || HookError::NotFound(name.to_string());

        let trimmed = name.trim_matches('/');
        if trimmed.is_empty() {
            return Err(not_found());
        }

        let relative = Path::new(trimmed);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || trimmed.split('/').any(str::is_empty) || trimmed.contains('\0') {
            return Err(not_found());
        }

        let stem = relative.file_name().ok_or_else(not_found)?;
        let dir = match relative.parent() {
            Some(parent) => self.root.join(parent),
            None => self.root.clone(),
        };

        let mut candidates: Vec<(String, PathBuf)> = std::fs::read_dir(&dir)
            .map_err(|_| not_found())?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                if path.file_stem()? != stem {
                    return None;
                }
                let ext = path.extension()?.to_str()?.to_string();
                let meta = std::fs::metadata(&path).ok()?;
                if !meta.is_file() {
                    return None;
                }
                let executable = meta.permissions().mode() & 0o111 != 0;
                (ext == PREFERRED_EXTENSION || executable).then_some((ext, path))
            })
            .collect();

        candidates.sort_by(|(a, _), (b, _)| {
            (a != PREFERRED_EXTENSION, a).cmp(&(b != PREFERRED_EXTENSION, b))
        });

        let (_, script) = candidates.into_iter().next().ok_or_else(not_found)?;
        let script = script.canonicalize().map_err(|_| not_found())?;
        if !self.contains(&script) {
            tracing::warn!(hook = name, path = %script.display(), "Hook resolves outside the scripts root");
            return Err(not_found());
        }
        Ok(script)
    }

    /// Whether `path` is a descendant of the root once canonicalized.
    pub fn contains(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical != self.root && canonical.starts_with(&self.root),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    fn write_script(dir: &Path, rel: &str, mode: u32) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, "#!/bin/sh\necho hi\n").expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod");
        path
    }

    #[test]
    fn resolves_shell_script() {
        let root = tempfile::tempdir().unwrap();
        write_script(root.path(), "echo.sh", 0o755);
        let scripts = ScriptsDir::new(root.path()).unwrap();

        let path = scripts.resolve("echo").expect("resolve");
        assert!(path.ends_with("echo.sh"));
        assert!(path.starts_with(scripts.root()));
    }

    #[test]
    fn resolves_nested_names_and_surrounding_slashes() {
        let root = tempfile::tempdir().unwrap();
        write_script(root.path(), "deploy/app.sh", 0o755);
        let scripts = ScriptsDir::new(root.path()).unwrap();

        let path = scripts.resolve("/deploy/app/").expect("resolve");
        assert!(path.ends_with("deploy/app.sh"));
    }

    #[test]
    fn prefers_sh_then_alphabetical_extension() {
        let root = tempfile::tempdir().unwrap();
        write_script(root.path(), "job.py", 0o755);
        write_script(root.path(), "job.bash", 0o755);
        let scripts = ScriptsDir::new(root.path()).unwrap();
        assert!(scripts.resolve("job").unwrap().ends_with("job.bash"));

        write_script(root.path(), "job.sh", 0o755);
        assert!(scripts.resolve("job").unwrap().ends_with("job.sh"));
    }

    #[test]
    fn ignores_non_executable_other_extensions() {
        let root = tempfile::tempdir().unwrap();
        write_script(root.path(), "notes.txt", 0o644);
        let scripts = ScriptsDir::new(root.path()).unwrap();
        assert_matches!(scripts.resolve("notes"), Err(HookError::NotFound(_)));
    }

    #[test]
    fn rejects_traversal() {
        let root = tempfile::tempdir().unwrap();
        let scripts_root = root.path().join("scripts");
        fs::create_dir(&scripts_root).unwrap();
        write_script(root.path(), "secret.sh", 0o755);
        let scripts = ScriptsDir::new(&scripts_root).unwrap();

        for name in ["../secret", "../../etc/passwd", "./secret", "a//b", "", "/"] {
            assert_matches!(
                scripts.resolve(name),
                Err(HookError::NotFound(_)),
                "name {name:?} should not resolve"
            );
        }
    }

    #[test]
    fn rejects_symlink_escape() {
        let root = tempfile::tempdir().unwrap();
        let scripts_root = root.path().join("scripts");
        fs::create_dir(&scripts_root).unwrap();
        let outside = write_script(root.path(), "outside.sh", 0o755);
        std::os::unix::fs::symlink(&outside, scripts_root.join("link.sh")).unwrap();
        let scripts = ScriptsDir::new(&scripts_root).unwrap();

        assert_matches!(scripts.resolve("link"), Err(HookError::NotFound(_)));
    }

    #[test]
    fn unknown_hook_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let scripts = ScriptsDir::new(root.path()).unwrap();
        assert_matches!(scripts.resolve("missing"), Err(HookError::NotFound(_)));
        assert_matches!(scripts.resolve("no/such/dir"), Err(HookError::NotFound(_)));
    }

    #[test]
    fn contains_checks_descendants_only() {
        let root = tempfile::tempdir().unwrap();
        let inside = write_script(root.path(), "a.sh", 0o755);
        let scripts = ScriptsDir::new(root.path()).unwrap();

        assert!(scripts.contains(&inside));
        assert!(!scripts.contains(root.path()));
        assert!(!scripts.contains(Path::new("/etc/passwd")));
    }

    #[test]
    fn missing_root_fails() {
        assert!(ScriptsDir::new("/definitely/not/here").is_err());
    }
}
