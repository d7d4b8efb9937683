// ABOUTME: Engine configuration: timeouts, size limits, and CLI-facing constants (spec.md §10.3)

use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const WELCOME_MESSAGE: &str = "Parsley";
pub const WELCOME_SUBTITLE: &str = "a dynamically-typed scripting language for HTML templating and data pipelines";

/// Engine-wide tunables that aren't security policy (spec.md §5, §9): HTTP
/// and subprocess timeouts, the I/O read/write size cap, and module cache
/// behavior. Generalizes the teacher's `FsConfig`/`NetConfig` split, which
/// became part of `security::SecurityConfig` once read/write/net/execute
/// were unified behind one `SecurityPolicy`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub http_timeout: Duration,
    pub subprocess_timeout: Option<Duration>,
    pub max_file_size: usize,
    pub clear_module_cache_on_reload: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            http_timeout: Duration::from_secs(30),
            subprocess_timeout: Some(Duration::from_secs(60)),
            max_file_size: 10 * 1024 * 1024,
            clear_module_cache_on_reload: true,
        }
    }
}

pub const HELP_TEXT: &str = r#"
Available commands:
  :quit / :exit       Exit the REPL
  :help               Show this help message
  :methods <type>     List methods on a value type

Type any Parsley expression to evaluate it. Ctrl-D exits.
"#;
