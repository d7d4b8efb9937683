// ABOUTME: Security policy consulted before every file read/write, network call, and exec

use crate::error::RuntimeError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

fn build_set(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

/// One direction's allow/deny glob pair. Deny always wins; an empty allow
/// list denies everything (spec.md §4.5: "Deny overrides allow. Empty-list
/// policies deny all.").
struct Rule {
    allow: GlobSet,
    allow_empty: bool,
    deny: GlobSet,
}

impl Rule {
    fn new(allow: &[String], deny: &[String]) -> Self {
        Rule { allow: build_set(allow), allow_empty: allow.is_empty(), deny: build_set(deny) }
    }

    fn check(&self, target: &str, op: &str) -> Result<(), RuntimeError> {
        if self.deny.is_match(target) {
            warn!(op, target, "security policy denied (explicit deny)");
            return Err(RuntimeError::security_denied(op, target));
        }
        if self.allow_empty || !self.allow.is_match(target) {
            warn!(op, target, "security policy denied (not in allowlist)");
            return Err(RuntimeError::security_denied(op, target));
        }
        Ok(())
    }
}

/// Builder-facing configuration; CLI flags (§6.2 `--no-write`, `--no-exec`,
/// `--restrict-read`, `--allow-net`) populate this the way the teacher's
/// `FsConfig`/`NetConfig` were populated from `CliArgs`. Defaults are
/// permissive for read/write/execute (CLI/dev ergonomics) and closed for
/// network, matching the teacher's "network disabled by default" sandbox
/// default.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allow_read: Vec<String>,
    pub deny_read: Vec<String>,
    pub allow_write: Vec<String>,
    pub deny_write: Vec<String>,
    pub allow_net: Vec<String>,
    pub allow_execute: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            allow_read: vec!["**".to_string()],
            deny_read: vec![],
            allow_write: vec!["**".to_string()],
            deny_write: vec![],
            allow_net: vec![],
            allow_execute: vec!["**".to_string()],
        }
    }
}

impl SecurityConfig {
    pub fn restrict_read(&mut self) {
        self.allow_read.clear();
    }

    pub fn deny_write(&mut self) {
        self.allow_write.clear();
    }

    pub fn deny_execute(&mut self) {
        self.allow_execute.clear();
    }

    pub fn enable_net(&mut self, addresses: Vec<String>) {
        self.allow_net = if addresses.is_empty() { vec!["**".to_string()] } else { addresses };
    }
}

/// The policy interface consulted at every I/O boundary (spec.md §4.5, §7,
/// §8 invariant 7). `Environment::security()` returning `None` means
/// unrestricted (dev/CLI mode, spec.md §3.4); an active `SecurityPolicy`
/// always enforces its four rules, each independently closed by default.
pub struct SecurityPolicy {
    read: Rule,
    write: Rule,
    net: Rule,
    execute: Rule,
}

impl SecurityPolicy {
    pub fn from_config(cfg: &SecurityConfig) -> Self {
        SecurityPolicy {
            read: Rule::new(&cfg.allow_read, &cfg.deny_read),
            write: Rule::new(&cfg.allow_write, &cfg.deny_write),
            net: Rule::new(&cfg.allow_net, &[]),
            execute: Rule::new(&cfg.allow_execute, &[]),
        }
    }

    pub fn permissive() -> Self {
        let mut cfg = SecurityConfig::default();
        cfg.allow_net = vec!["**".to_string()];
        SecurityPolicy::from_config(&cfg)
    }

    pub fn check_read(&self, path: &str) -> Result<(), RuntimeError> {
        self.read.check(path, "read")
    }

    pub fn check_write(&self, path: &str) -> Result<(), RuntimeError> {
        self.write.check(path, "write")
    }

    pub fn check_net(&self, url: &str) -> Result<(), RuntimeError> {
        self.net.check(url, "network")
    }

    pub fn check_execute(&self, program: &str) -> Result<(), RuntimeError> {
        self.execute.check(program, "execute")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_allows_everything() {
        let policy = SecurityPolicy::permissive();
        assert!(policy.check_read("/etc/passwd").is_ok());
        assert!(policy.check_write("./out.json").is_ok());
        assert!(policy.check_net("https://example.com").is_ok());
    }

    #[test]
    fn empty_allowlist_denies_all_reads() {
        let mut cfg = SecurityConfig::default();
        cfg.restrict_read();
        let policy = SecurityPolicy::from_config(&cfg);
        assert!(policy.check_read("./data.json").is_err());
    }

    #[test]
    fn allowlisted_glob_permits_match() {
        let cfg = SecurityConfig { allow_read: vec!["./data/**".to_string()], ..Default::default() };
        let policy = SecurityPolicy::from_config(&cfg);
        assert!(policy.check_read("./data/u.json").is_ok());
        assert!(policy.check_read("./secret/u.json").is_err());
    }

    #[test]
    fn deny_overrides_allow() {
        let cfg = SecurityConfig {
            allow_read: vec!["./data/**".to_string()],
            deny_read: vec!["./data/secret.json".to_string()],
            ..Default::default()
        };
        let policy = SecurityPolicy::from_config(&cfg);
        assert!(policy.check_read("./data/public.json").is_ok());
        assert!(policy.check_read("./data/secret.json").is_err());
    }

    #[test]
    fn network_disabled_by_default() {
        let policy = SecurityPolicy::from_config(&SecurityConfig::default());
        assert!(policy.check_net("https://example.com").is_err());
    }

    #[test]
    fn execute_default_is_permissive_until_denied() {
        let policy = SecurityPolicy::from_config(&SecurityConfig::default());
        assert!(policy.check_execute("/bin/echo").is_ok());
        let mut cfg = SecurityConfig::default();
        cfg.deny_execute();
        assert!(SecurityPolicy::from_config(&cfg).check_execute("/bin/echo").is_err());
    }
}
