//! Binary trust audit.
//!
//! Before spawning, the target agent binary is resolved to an absolute path
//! and compared against a set of trusted filesystem prefixes. A path outside
//! the trusted set is logged and reported as an advisory, never blocked:
//! this is an audit trail against PATH hijacking, not a security boundary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::core::types::Advisory;

/// Trusted filesystem prefixes for agent binaries.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    trusted_prefixes: Vec<PathBuf>,
}

impl TrustPolicy {
    /// Standard install locations plus the user's own bin directories.
    pub fn standard() -> Self {
        let mut trusted_prefixes = vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/bin"),
            PathBuf::from("/opt/homebrew/bin"),
        ];
        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            trusted_prefixes.push(home.join(".local/bin"));
            trusted_prefixes.push(home.join(".cargo/bin"));
        }
        TrustPolicy { trusted_prefixes }
    }

    /// Extend the standard set with user-configured prefixes.
    pub fn with_additions(additions: &[PathBuf]) -> Self {
        let mut policy = TrustPolicy::standard();
        policy.trusted_prefixes.extend(additions.iter().cloned());
        policy
    }

    fn is_trusted(&self, resolved: &Path) -> bool {
        self.trusted_prefixes.iter().any(|prefix| {
            // Compare against the canonical prefix when it exists, so
            // symlinked install dirs still match.
            let canonical = fs::canonicalize(prefix);
            let prefix = canonical.as_deref().unwrap_or(prefix.as_path());
            resolved.starts_with(prefix)
        })
    }
}

/// Resolve `binary` to an absolute path and audit it against `policy`.
///
/// Returns the resolved path and, when it lies outside every trusted
/// prefix, an [`Advisory::UntrustedBinary`]. Resolution failure is a real
/// error: there is nothing to spawn.
pub fn audit_binary(binary: &str, policy: &TrustPolicy) -> Result<(PathBuf, Option<Advisory>)> {
    let resolved = resolve_binary(binary)?;
    if policy.is_trusted(&resolved) {
        debug!(binary, resolved = %resolved.display(), "binary within trusted prefixes");
        return Ok((resolved, None));
    }
    warn!(
        binary,
        resolved = %resolved.display(),
        "agent binary resolved outside trusted prefixes"
    );
    let advisory = Advisory::UntrustedBinary {
        binary: binary.to_string(),
        resolved: resolved.display().to_string(),
    };
    Ok((resolved, Some(advisory)))
}

/// Resolve a binary name or path to a canonical absolute path.
fn resolve_binary(binary: &str) -> Result<PathBuf> {
    let candidate = if binary.contains('/') {
        PathBuf::from(binary)
    } else {
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        search_path(binary, &path_var.to_string_lossy())
            .ok_or_else(|| anyhow!("binary '{binary}' not found on PATH"))?
    };
    fs::canonicalize(&candidate)
        .with_context(|| format!("canonicalize binary path {}", candidate.display()))
}

fn search_path(binary: &str, path_var: &str) -> Option<PathBuf> {
    path_var
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_binary(temp: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = temp.path().join(name);
        fs::write(&path, "#!/bin/sh\n").expect("write binary");
        path
    }

    #[test]
    fn search_path_finds_first_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let other = tempfile::tempdir().expect("tempdir");
        fake_binary(&temp, "agent");

        let path_var = format!(
            "{}:{}",
            other.path().display(),
            temp.path().display()
        );
        let found = search_path("agent", &path_var).expect("found");
        assert_eq!(found, temp.path().join("agent"));
        assert!(search_path("missing", &path_var).is_none());
    }

    #[test]
    fn trusted_prefix_produces_no_advisory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let binary = fake_binary(&temp, "agent");
        let policy = TrustPolicy::with_additions(&[temp.path().to_path_buf()]);

        let (resolved, advisory) =
            audit_binary(&binary.to_string_lossy(), &policy).expect("audit");
        assert!(resolved.is_absolute());
        assert!(advisory.is_none());
    }

    /// Untrusted paths are reported, not blocked.
    #[test]
    fn untrusted_prefix_is_advisory_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let binary = fake_binary(&temp, "agent");
        let policy = TrustPolicy::standard();

        let (resolved, advisory) =
            audit_binary(&binary.to_string_lossy(), &policy).expect("audit");
        assert!(resolved.is_absolute());
        match advisory {
            Some(Advisory::UntrustedBinary { binary: name, .. }) => {
                assert!(name.contains("agent"));
            }
            other => panic!("expected untrusted-binary advisory, got {other:?}"),
        }
    }

    #[test]
    fn unresolvable_binary_is_an_error() {
        let policy = TrustPolicy::standard();
        let err = audit_binary("definitely-not-a-real-binary-name", &policy).unwrap_err();
        assert!(err.to_string().contains("not found on PATH"));
    }
}
