use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::{FloorError, Result};

/// Directories a caller-supplied reference path must resolve under.
///
/// Roots are canonicalized once at construction; a root that does not exist
/// cannot contain anything and is dropped. Ancestry is checked component-wise
/// on canonical paths, so `refs_evil/` never matches a `refs/` root.
#[derive(Debug, Clone, Default)]
pub struct PathAllowlist {
    roots: Vec<PathBuf>,
}

impl PathAllowlist {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut allowlist = Self::default();
        for root in roots {
            allowlist.add_root(root);
        }
        allowlist
    }

    /// Returns false when the root could not be resolved.
    pub fn add_root(&mut self, root: impl AsRef<Path>) -> bool {
        let Ok(canonical) = std::fs::canonicalize(expand_home(root.as_ref())) else {
            return false;
        };
        if !canonical.is_dir() {
            return false;
        }
        if !self.roots.contains(&canonical) {
            self.roots.push(canonical);
        }
        true
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn contains(&self, canonical: &Path) -> bool {
        self.roots.iter().any(|root| canonical.starts_with(root))
    }

    /// Resolve `raw` and return its canonical form if it is an existing regular
    /// file under one of the roots. Read-only; the caller reads the file after.
    pub fn validate(&self, raw: &str) -> Result<PathBuf> {
        let input = raw.trim();
        if input.is_empty() {
            return Err(invalid(raw, "path is empty"));
        }
        if input.contains('\0') {
            return Err(invalid(raw, "path contains a NUL byte"));
        }

        let expanded = expand_home(Path::new(input));
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()
                .map_err(|err| invalid(raw, &format!("working directory unavailable: {err}")))?
                .join(expanded)
        };

        match std::fs::canonicalize(&absolute) {
            Ok(canonical) => {
                if !self.contains(&canonical) {
                    return Err(not_allowed(raw));
                }
                if !canonical.is_file() {
                    return Err(not_found(raw));
                }
                Ok(canonical)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Missing files still get the ancestry check so probing outside
                // the roots reports "not allowed" rather than existence.
                let resolved = resolve_existing_prefix(&lexically_normalize(&absolute));
                if !self.contains(&resolved) {
                    return Err(not_allowed(raw));
                }
                Err(not_found(raw))
            }
            Err(err) => Err(invalid(raw, &err.to_string())),
        }
    }
}

fn invalid(raw: &str, reason: &str) -> FloorError {
    FloorError::InvalidPath {
        input: raw.to_string(),
        reason: reason.to_string(),
    }
}

fn not_allowed(raw: &str) -> FloorError {
    FloorError::PathNotAllowed {
        input: raw.to_string(),
    }
}

fn not_found(raw: &str) -> FloorError {
    FloorError::FileNotFound {
        input: raw.to_string(),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// Drop `.` and fold `..` without touching the filesystem.
fn lexically_normalize(path: &Path) -> PathBuf {
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

/// Canonicalize the deepest existing ancestor and re-append the missing tail.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut tail = Vec::new();
    let mut current = path;
    loop {
        if let Ok(canonical) = std::fs::canonicalize(current) {
            let mut resolved = canonical;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                current = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    struct Fixture {
        _temp: tempfile::TempDir,
        base: PathBuf,
        allowlist: PathAllowlist,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let base = fs::canonicalize(temp.path())?;
        fs::create_dir_all(base.join("refs").join("oak"))?;
        fs::create_dir_all(base.join("refs_evil"))?;
        fs::create_dir_all(base.join("outside"))?;
        fs::write(base.join("refs").join("oak").join("natural.png"), b"png")?;
        fs::write(base.join("refs_evil").join("evil.png"), b"png")?;
        fs::write(base.join("outside").join("secret.png"), b"png")?;
        let allowlist = PathAllowlist::new([base.join("refs")]);
        Ok(Fixture {
            _temp: temp,
            base,
            allowlist,
        })
    }

    #[test]
    fn accepts_files_under_a_root() -> anyhow::Result<()> {
        let fx = fixture()?;
        let target = fx.base.join("refs").join("oak").join("natural.png");
        let resolved = fx.allowlist.validate(&target.to_string_lossy())?;
        assert_eq!(resolved, target);

        let dotted = fx.base.join("refs").join(".").join("oak").join("..").join("oak").join("natural.png");
        assert_eq!(fx.allowlist.validate(&dotted.to_string_lossy())?, target);
        Ok(())
    }

    #[test]
    fn rejects_traversal_out_of_root() -> anyhow::Result<()> {
        let fx = fixture()?;
        let escape = format!("{}/refs/../outside/secret.png", fx.base.display());
        assert!(matches!(
            fx.allowlist.validate(&escape),
            Err(FloorError::PathNotAllowed { .. })
        ));

        let deep = format!("{}/refs/../../../../etc/passwd", fx.base.display());
        assert!(matches!(
            fx.allowlist.validate(&deep),
            Err(FloorError::PathNotAllowed { .. })
        ));
        Ok(())
    }

    #[test]
    fn sibling_with_shared_prefix_is_not_a_descendant() -> anyhow::Result<()> {
        let fx = fixture()?;
        let sibling = fx.base.join("refs_evil").join("evil.png");
        assert!(matches!(
            fx.allowlist.validate(&sibling.to_string_lossy()),
            Err(FloorError::PathNotAllowed { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_or_non_regular_files_are_not_found() -> anyhow::Result<()> {
        let fx = fixture()?;
        let missing = fx.base.join("refs").join("oak").join("ghost.png");
        assert!(matches!(
            fx.allowlist.validate(&missing.to_string_lossy()),
            Err(FloorError::FileNotFound { .. })
        ));

        let directory = fx.base.join("refs").join("oak");
        assert!(matches!(
            fx.allowlist.validate(&directory.to_string_lossy()),
            Err(FloorError::FileNotFound { .. })
        ));

        let missing_outside = format!("{}/refs/../outside/ghost.png", fx.base.display());
        assert!(matches!(
            fx.allowlist.validate(&missing_outside),
            Err(FloorError::PathNotAllowed { .. })
        ));
        Ok(())
    }

    #[test]
    fn blank_input_is_invalid() -> anyhow::Result<()> {
        let fx = fixture()?;
        assert!(matches!(
            fx.allowlist.validate("   "),
            Err(FloorError::InvalidPath { .. })
        ));
        assert!(matches!(
            fx.allowlist.validate("refs/\0oak.png"),
            Err(FloorError::InvalidPath { .. })
        ));
        Ok(())
    }

    #[test]
    fn error_text_never_contains_the_resolved_target() -> anyhow::Result<()> {
        let fx = fixture()?;
        let escape = format!("{}/refs/../outside/secret.png", fx.base.display());
        let err = fx.allowlist.validate(&escape).unwrap_err();
        let resolved = fx.base.join("outside").join("secret.png");
        assert!(!err.to_string().contains(&*resolved.to_string_lossy()));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_the_root_is_rejected() -> anyhow::Result<()> {
        let fx = fixture()?;
        let link = fx.base.join("refs").join("shortcut.png");
        std::os::unix::fs::symlink(fx.base.join("outside").join("secret.png"), &link)?;
        assert!(matches!(
            fx.allowlist.validate(&link.to_string_lossy()),
            Err(FloorError::PathNotAllowed { .. })
        ));
        Ok(())
    }

    #[test]
    fn nonexistent_roots_are_dropped() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut allowlist = PathAllowlist::new([fx.base.join("nope")]);
        assert!(allowlist.is_empty());
        assert!(allowlist.add_root(fx.base.join("refs")));
        assert!(allowlist.add_root(fx.base.join("refs")));
        assert_eq!(allowlist.roots().len(), 1);
        Ok(())
    }

    #[test]
    fn lexical_normalization_folds_parent_segments() {
        assert_eq!(
            lexically_normalize(Path::new("/a/b/./c/../../d")),
            PathBuf::from("/a/d")
        );
        assert_eq!(lexically_normalize(Path::new("/../../etc")), PathBuf::from("/etc"));
    }
}
