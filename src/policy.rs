//! Policy tables: the import allowlist and the forbidden-operation set.
//!
//! A `PolicySet` is built once at startup and shared read-only (`Arc`) by the
//! validator, the import guardian and every gate. Nothing mutates it after
//! construction.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Module roots importable by submitted source.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "__future__",
    "abc",
    "bisect",
    "cmath",
    "collections",
    "copy",
    "dataclasses",
    "decimal",
    "enum",
    "fractions",
    "functools",
    "heapq",
    "itertools",
    "math",
    "numbers",
    "operator",
    "re",
    "statistics",
    "string",
    "typing",
    "typing_extensions",
];

/// Operations that must never be reached, however they are spelled.
pub const DEFAULT_FORBIDDEN_OPERATIONS: &[&str] = &[
    // code execution
    "eval",
    "exec",
    "compile",
    "__import__",
    "import_module",
    "reload",
    "breakpoint",
    // filesystem and process
    "open",
    "input",
    "system",
    "popen",
    "spawn",
    "fork",
    "execv",
    "exit",
    "quit",
    // namespace introspection
    "globals",
    "locals",
    "vars",
    "dir",
    "setattr",
    "delattr",
    "__builtins__",
    "__globals__",
    "__code__",
    "__closure__",
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "__loader__",
    "__spec__",
    "f_globals",
    "f_locals",
    "f_back",
    "gi_frame",
    "tb_frame",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySet {
    allowed_modules: BTreeSet<String>,
    forbidden_operations: BTreeSet<String>,
}

impl PolicySet {
    pub fn new<A, F>(allowed_modules: A, forbidden_operations: F) -> Result<Self>
    where
        A: IntoIterator,
        A::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let allowed_modules = collect_names("allowed module", allowed_modules)?;
        let forbidden_operations = collect_names("forbidden operation", forbidden_operations)?;
        if forbidden_operations.is_empty() {
            return Err(anyhow!("policy: forbidden operation set must not be empty"));
        }
        if allowed_modules.is_empty() {
            log::warn!("policy: empty module allowlist, every import will be rejected");
        }
        Ok(Self {
            allowed_modules,
            forbidden_operations,
        })
    }

    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }

    pub fn forbidden_operations(&self) -> impl Iterator<Item = &str> {
        self.forbidden_operations.iter().map(String::as_str)
    }

    /// True if the root of `path` is on the allowlist.
    pub fn allows_module(&self, path: &str) -> bool {
        let root = module_root(path);
        !root.is_empty() && self.allowed_modules.contains(root)
    }

    pub fn forbids(&self, operation: &str) -> bool {
        self.forbidden_operations.contains(operation)
    }

    /// SHA-256 over both tables; identifies the policy in logs and reports.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"allowed_modules\0");
        for name in &self.allowed_modules {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"forbidden_operations\0");
        for name in &self.forbidden_operations {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            forbidden_operations: DEFAULT_FORBIDDEN_OPERATIONS
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

/// Root identifier of a dotted module path: `"os.path"` -> `"os"`.
///
/// Relative paths (leading dots) have an empty root and are never allowed.
pub fn module_root(path: &str) -> &str {
    path.split('.').next().unwrap_or("").trim()
}

const POLICY_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,127}$";

/// Policy names are plain identifiers of at most 128 characters; anything
/// else is a configuration error.
pub fn validate_policy_name(name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(POLICY_NAME_PATTERN).unwrap());
    if !re.is_match(name) {
        return Err(anyhow!(
            "policy: '{}' is not an identifier of at most 128 characters (expected {})",
            name,
            POLICY_NAME_PATTERN
        ));
    }
    Ok(())
}

fn collect_names<I>(what: &str, names: I) -> Result<BTreeSet<String>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut set = BTreeSet::new();
    for name in names {
        let name: String = name.into();
        let name = name.trim().to_string();
        validate_policy_name(&name).map_err(|e| anyhow!("invalid {}: {}", what, e))?;
        set.insert(name);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_root_takes_first_segment() {
        assert_eq!(module_root("os.path"), "os");
        assert_eq!(module_root("math"), "math");
        assert_eq!(module_root(".sibling"), "");
    }

    #[test]
    fn submodule_of_blocked_root_is_blocked() {
        let policy = PolicySet::default();
        assert!(policy.allows_module("collections.abc"));
        assert!(!policy.allows_module("os.path"));
        assert!(!policy.allows_module("osmosis"));
        assert!(!policy.allows_module(""));
    }

    #[test]
    fn rejects_non_identifier_names() {
        assert!(PolicySet::new(["math"], ["eval", "os.system"]).is_err());
        assert!(PolicySet::new(["ma th"], ["eval"]).is_err());
        assert!(PolicySet::new(["math"], Vec::<String>::new()).is_err());
    }

    #[test]
    fn name_length_limit_is_reported() {
        let longest = format!("a{}", "b".repeat(127));
        assert!(validate_policy_name(&longest).is_ok());
        let err = validate_policy_name(&format!("{}c", longest)).expect_err("129 characters");
        assert!(err.to_string().contains("at most 128 characters"));
        assert!(err.to_string().contains("{0,127}"));
    }

    #[test]
    fn fingerprint_ignores_order_and_duplicates() -> Result<()> {
        let a = PolicySet::new(["math", "re"], ["eval", "exec"])?;
        let b = PolicySet::new(["re", "math", "re"], ["exec", "eval"])?;
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = PolicySet::new(["math"], ["eval", "exec"])?;
        assert_ne!(a.fingerprint(), c.fingerprint());
        Ok(())
    }

    #[test]
    fn tables_do_not_bleed_into_each_other() -> Result<()> {
        let a = PolicySet::new(["eval"], ["math"])?;
        let b = PolicySet::new(["math"], ["eval"])?;
        assert_ne!(a.fingerprint_hex(), b.fingerprint_hex());
        Ok(())
    }
}
