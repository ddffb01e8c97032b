//! Capability registry: the static allow-list of importable modules.
//!
//! The registry is the security boundary for imports, kept as a fixed,
//! auditable data structure rather than scattered runtime checks. It is
//! built once at process start; scripts have no registration API.

use crate::sandbox::error::{SandboxError, SandboxResult};

/// Private namespace prefix wrapped and library imports are rehomed under.
/// Scripts writing the prefix themselves is harmless: resolution still goes
/// through the same registry checks.
pub const SANDBOX_PREFIX: &str = "@sandbox/";

/// Prefix of the package-definition library namespace (`lib.<x>` resolves
/// to `<repository>/lib/<x>.lua`).
pub const LIB_NAMESPACE: &str = "lib.";

/// What the registry says about a module name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Not listed: import is a hard failure.
    Denied,
    /// Proxied host module, rehomed under [`SANDBOX_PREFIX`].
    Wrapped,
    /// Real host module handed through (host API and safe utilities only).
    Whitelisted,
    /// Repository-provided class library (`lib.<x>`), rehomed under
    /// [`SANDBOX_PREFIX`] and resolved to a repository file.
    Library,
}

/// The process-wide capability table.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    wrapped: &'static [&'static str],
    whitelisted: &'static [&'static str],
}

/// Host modules exposed through write-guarded proxies.
const WRAPPED: &[&str] = &["fs", "env"];

/// Host modules handed through directly: the package-definition API and
/// safe utilities.
const WHITELISTED: &[&str] = &["pkg", "version"];

impl CapabilityRegistry {
    /// The standard registry. Fixed at process start.
    pub fn standard() -> Self {
        Self {
            wrapped: WRAPPED,
            whitelisted: WHITELISTED,
        }
    }

    /// Classify a module name. Names already carrying [`SANDBOX_PREFIX`]
    /// are classified by their unprefixed form.
    pub fn is_allowed(&self, module: &str) -> Capability {
        let name = module.strip_prefix(SANDBOX_PREFIX).unwrap_or(module);
        if self.whitelisted.contains(&name) {
            Capability::Whitelisted
        } else if self.wrapped.contains(&name) {
            Capability::Wrapped
        } else if name.starts_with(LIB_NAMESPACE) && name.len() > LIB_NAMESPACE.len() {
            Capability::Library
        } else {
            Capability::Denied
        }
    }

    /// Classify, turning `Denied` into the hard error the importer and the
    /// policy transformer both raise.
    pub fn require_allowed(&self, module: &str) -> SandboxResult<Capability> {
        match self.is_allowed(module) {
            Capability::Denied => Err(SandboxError::DeniedImport {
                module: module.to_string(),
            }),
            cap => Ok(cap),
        }
    }

    /// The rehomed (private-namespace) form of a module name, if rehoming
    /// applies to its capability class.
    pub fn rehome(&self, module: &str) -> Option<String> {
        match self.is_allowed(module) {
            Capability::Wrapped | Capability::Library => {
                let name = module.strip_prefix(SANDBOX_PREFIX).unwrap_or(module);
                Some(format!("{SANDBOX_PREFIX}{name}"))
            }
            _ => None,
        }
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelisted_entries() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.is_allowed("pkg"), Capability::Whitelisted);
        assert_eq!(reg.is_allowed("version"), Capability::Whitelisted);
    }

    #[test]
    fn wrapped_entries_rehome() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.is_allowed("fs"), Capability::Wrapped);
        assert_eq!(reg.rehome("fs").as_deref(), Some("@sandbox/fs"));
    }

    #[test]
    fn library_namespace_pattern() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.is_allowed("lib.mw-base"), Capability::Library);
        assert_eq!(
            reg.rehome("lib.mw-base").as_deref(),
            Some("@sandbox/lib.mw-base")
        );
        // A bare "lib." with no module name is not a library.
        assert_eq!(reg.is_allowed("lib."), Capability::Denied);
    }

    #[test]
    fn everything_else_denied() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.is_allowed("os"), Capability::Denied);
        assert_eq!(reg.is_allowed("io"), Capability::Denied);
        assert_eq!(reg.is_allowed("debug"), Capability::Denied);
        assert!(reg.require_allowed("os").is_err());
    }

    #[test]
    fn prefixed_names_classified_by_unprefixed_form() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.is_allowed("@sandbox/fs"), Capability::Wrapped);
        assert_eq!(reg.is_allowed("@sandbox/os"), Capability::Denied);
    }

    #[test]
    fn whitelisted_never_rehomed() {
        let reg = CapabilityRegistry::standard();
        assert_eq!(reg.rehome("pkg"), None);
    }
}
