//! Glob-based deny/allow permission gate.
//!
//! Two independent pattern sets: tool names and filesystem paths. Deny
//! patterns always win; an empty allow list means "everything permitted".

use glob::Pattern;

use fm_domain::config::ToolsConfig;

pub struct PermissionGate {
    tool_allow: Vec<Pattern>,
    tool_deny: Vec<Pattern>,
    path_allow: Vec<Pattern>,
    path_deny: Vec<Pattern>,
}

fn compile(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::warn!(pattern = %p, error = %e, "skipping invalid glob pattern");
                None
            }
        })
        .collect()
}

impl PermissionGate {
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            tool_allow: compile(&config.allow),
            tool_deny: compile(&config.deny),
            path_allow: compile(&config.path_allow),
            path_deny: compile(&config.path_deny),
        }
    }

    /// A gate that permits everything (used by tests and the CLI).
    pub fn permissive() -> Self {
        Self {
            tool_allow: Vec::new(),
            tool_deny: Vec::new(),
            path_allow: Vec::new(),
            path_deny: Vec::new(),
        }
    }

    pub fn tool_permitted(&self, name: &str) -> bool {
        if self.tool_deny.iter().any(|p| p.matches(name)) {
            return false;
        }
        self.tool_allow.is_empty() || self.tool_allow.iter().any(|p| p.matches(name))
    }

    pub fn path_permitted(&self, path: &str) -> bool {
        if self.path_deny.iter().any(|p| p.matches(path)) {
            return false;
        }
        self.path_allow.is_empty() || self.path_allow.iter().any(|p| p.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(allow: &[&str], deny: &[&str]) -> PermissionGate {
        let config = ToolsConfig {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            path_allow: Vec::new(),
            path_deny: Vec::new(),
            shell_timeout_secs: 1,
        };
        PermissionGate::from_config(&config)
    }

    #[test]
    fn empty_allow_permits_all() {
        let gate = gate(&[], &[]);
        assert!(gate.tool_permitted("fs:read"));
        assert!(gate.tool_permitted("shell:exec"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let gate = gate(&["fs:*"], &["fs:delete"]);
        assert!(gate.tool_permitted("fs:read"));
        assert!(!gate.tool_permitted("fs:delete"));
        assert!(!gate.tool_permitted("shell:exec"));
    }

    #[test]
    fn path_deny_defaults_protect_git() {
        let config = ToolsConfig::default();
        let gate = PermissionGate::from_config(&config);
        assert!(!gate.path_permitted("repo/.git/config"));
        assert!(gate.path_permitted("repo/src/main.rs"));
    }

    #[test]
    fn invalid_pattern_is_skipped() {
        let gate = gate(&["[invalid"], &[]);
        // The only allow pattern was invalid, so the allow list is empty
        // and everything is permitted.
        assert!(gate.tool_permitted("fs:read"));
    }
}
