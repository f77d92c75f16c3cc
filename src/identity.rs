// src/identity.rs
// Tenant/team/project identity and collection-name derivation

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ContextdError, Result};

/// Maximum length of a derived collection name.
const MAX_COLLECTION_NAME: usize = 64;

/// Collection suffixes used by the core components.
pub const SUFFIX_CHECKPOINTS: &str = "checkpoints";
pub const SUFFIX_MEMORIES: &str = "memories";
pub const SUFFIX_REMEDIATIONS: &str = "remediations";
pub const SUFFIX_CONVERSATIONS: &str = "conversations";

/// Caller identity attached to every store operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantInfo {
    pub tenant_id: String,
    #[serde(default)]
    pub team_id: Option<String>,
    pub project_id: String,
}

impl TenantInfo {
    pub fn new(tenant_id: &str, team_id: Option<&str>, project_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            team_id: team_id.map(String::from),
            project_id: project_id.to_string(),
        }
    }

    /// Build a tenant context for a project path, hashing the path into a
    /// stable project id.
    pub fn for_path(tenant_id: &str, team_id: Option<&str>, project_path: &str) -> Self {
        Self::new(tenant_id, team_id, &project_id_from_path(project_path))
    }
}

/// Stable project identifier: first 16 hex chars of sha256(path).
pub fn project_id_from_path(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Sanitize an arbitrary string into a collection-name-safe identifier.
///
/// Lowercases, maps non-alphanumerics to `_`, collapses runs of `_`, and
/// trims leading/trailing `_`. Empty results become `"default"`.
pub fn sanitize_identifier(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_underscore = false;
    for c in s.chars() {
        let mapped = if c.is_ascii_alphanumeric() {
            last_underscore = false;
            c.to_ascii_lowercase()
        } else {
            if last_underscore {
                continue;
            }
            last_underscore = true;
            '_'
        };
        out.push(mapped);
    }
    let trimmed = out.trim_matches('_').to_string();
    if trimmed.is_empty() {
        "default".to_string()
    } else {
        trimmed
    }
}

/// Derive the collection name for `(tenant, project, suffix)`.
///
/// Pure and deterministic. Names longer than 64 chars are truncated to 55
/// and suffixed with `_` plus the first 8 hex chars of the sha256 of the
/// original name, so distinct long names stay distinct.
pub fn collection_name(tenant: &str, project_id: &str, suffix: &str) -> String {
    let raw = format!("{tenant}_{project_id}_{suffix}");
    let name = sanitize_identifier(&raw);
    cap_collection_name(name)
}

/// Derive the team-wide pattern collection name (`{team}_patterns`).
pub fn team_collection_name(team: &str) -> String {
    cap_collection_name(sanitize_identifier(&format!("{team}_patterns")))
}

fn cap_collection_name(name: String) -> String {
    if name.len() <= MAX_COLLECTION_NAME {
        return name;
    }
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}", &name[..55], &digest[..8])
}

/// Validate a tenant identifier: non-empty, `[a-z0-9_]` only, no leading
/// underscore.
pub fn validate_tenant_id(tenant: &str) -> Result<()> {
    if tenant.is_empty() {
        return Err(ContextdError::validation("tenant_id", "must not be empty"));
    }
    if tenant.starts_with('_') {
        return Err(ContextdError::validation(
            "tenant_id",
            "must not start with underscore",
        ));
    }
    if !tenant
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ContextdError::validation(
            "tenant_id",
            "must contain only lowercase letters, digits, and underscores",
        ));
    }
    Ok(())
}

/// Validate a team identifier. Empty is allowed (no team).
pub fn validate_team_id(team: &str) -> Result<()> {
    if team.is_empty() {
        return Ok(());
    }
    validate_tenant_id(team).map_err(|_| {
        ContextdError::validation(
            "team_id",
            "must contain only lowercase letters, digits, and underscores",
        )
    })
}

/// Validate a glob pattern before it reaches any matcher.
///
/// Rejects traversal and shell metacharacters, and runs of 4+ `*` which are
/// pathological for glob engines.
pub fn validate_glob_pattern(pattern: &str) -> Result<()> {
    if pattern.contains("..") {
        return Err(ContextdError::validation(
            "pattern",
            "must not contain '..'",
        ));
    }
    for forbidden in [';', '|', '`'] {
        if pattern.contains(forbidden) {
            return Err(ContextdError::validation(
                "pattern",
                format!("must not contain '{forbidden}'"),
            ));
        }
    }
    if pattern.contains("****") {
        return Err(ContextdError::validation(
            "pattern",
            "must not contain runs of four or more '*'",
        ));
    }
    Ok(())
}

/// Validate a filesystem path, optionally confining it under `root`.
///
/// Rejects empty paths and any literal `..` component, both before and after
/// lexical cleaning. With `root`, the cleaned path must have the cleaned
/// root as a prefix. Returns the cleaned path on success.
pub fn validate_path(path: &str, root: Option<&Path>) -> Result<PathBuf> {
    if path.trim().is_empty() {
        return Err(ContextdError::validation("path", "must not be empty"));
    }
    let raw = Path::new(path);
    if raw.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ContextdError::validation(
            "path",
            "must not contain '..' components",
        ));
    }
    let cleaned = clean_path(raw);
    if cleaned
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ContextdError::validation(
            "path",
            "must not contain '..' components",
        ));
    }
    if let Some(root) = root {
        let root = clean_path(root);
        if !cleaned.starts_with(&root) {
            return Err(ContextdError::PermissionDenied(format!(
                "path escapes root {}",
                root.display()
            )));
        }
    }
    Ok(cleaned)
}

/// Extract a validated basename from a path.
pub fn safe_basename(path: &str) -> Result<String> {
    let cleaned = validate_path(path, None)?;
    cleaned
        .file_name()
        .and_then(|n| n.to_str())
        .map(String::from)
        .ok_or_else(|| ContextdError::validation("path", "has no basename"))
}

/// Lexically normalize a path: drop `.` components, keep everything else.
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_is_deterministic() {
        let a = collection_name("acme", "abc123", "checkpoints");
        let b = collection_name("acme", "abc123", "checkpoints");
        assert_eq!(a, b);
        assert_eq!(a, "acme_abc123_checkpoints");
    }

    #[test]
    fn test_collection_name_charset() {
        let name = collection_name("Acme Corp!", "p/1", "Check Points");
        assert!(name.chars().all(|c| c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '_'));
        assert!(!name.starts_with('_'));
        assert!(!name.ends_with('_'));
        assert_eq!(name, "acme_corp_p_1_check_points");
    }

    #[test]
    fn test_sanitize_collapses_and_trims() {
        assert_eq!(sanitize_identifier("--a__b--"), "a_b");
        assert_eq!(sanitize_identifier("!!!"), "default");
        assert_eq!(sanitize_identifier(""), "default");
    }

    #[test]
    fn test_long_collection_name_truncated_with_hash() {
        let long = "x".repeat(120);
        let name = collection_name(&long, "project", "checkpoints");
        assert_eq!(name.len(), 64);
        assert!(name.starts_with(&"x".repeat(55)));
        // Two distinct long names must not collide.
        let other = collection_name(&format!("{}y", "x".repeat(119)), "project", "checkpoints");
        assert_ne!(name, other);
    }

    #[test]
    fn test_project_id_from_path() {
        let id = project_id_from_path("/home/user/project");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, project_id_from_path("/home/user/project"));
        assert_ne!(id, project_id_from_path("/home/user/other"));
    }

    #[test]
    fn test_validate_tenant_id() {
        assert!(validate_tenant_id("acme_dev1").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("Acme").is_err());
        assert!(validate_tenant_id("_acme").is_err());
        assert!(validate_tenant_id("acme-dev").is_err());
    }

    #[test]
    fn test_validate_team_id_allows_empty() {
        assert!(validate_team_id("").is_ok());
        assert!(validate_team_id("platform").is_ok());
        assert!(validate_team_id("Platform").is_err());
    }

    #[test]
    fn test_validate_glob_pattern() {
        assert!(validate_glob_pattern("src/**/*.rs").is_ok());
        assert!(validate_glob_pattern("../etc/passwd").is_err());
        assert!(validate_glob_pattern("a;rm -rf /").is_err());
        assert!(validate_glob_pattern("a|b").is_err());
        assert!(validate_glob_pattern("`cmd`").is_err());
        assert!(validate_glob_pattern("a****b").is_err());
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        assert!(validate_path("", None).is_err());
        assert!(validate_path("/a/../b", None).is_err());
        assert!(validate_path("..", None).is_err());
        assert!(validate_path("/a/b/c", None).is_ok());
    }

    #[test]
    fn test_validate_path_with_root() {
        let root = Path::new("/srv/projects");
        assert!(validate_path("/srv/projects/app", Some(root)).is_ok());
        assert!(validate_path("/srv/other/app", Some(root)).is_err());
    }

    #[test]
    fn test_safe_basename() {
        assert_eq!(safe_basename("/a/b/file.txt").unwrap(), "file.txt");
        assert!(safe_basename("/a/../b").is_err());
    }
}
