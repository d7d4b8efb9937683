// ABOUTME: Subprocess execution engine behind @shell(...) and <=#=> (spec.md §4.8)

use crate::error::RuntimeError;
use crate::security::SecurityPolicy;
use crate::value::{Dict, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

/// A prepared `@shell(...)` invocation: program + args, resolved directly
/// via `std::process::Command` (no shell interposed, spec.md §4.8 "direct
/// OS exec, no shell").
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Command { program: program.into(), args: Vec::new(), cwd: None, env: HashMap::new(), timeout: None }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Output of a run, shaped the way a handler destructures it
/// (`{stdout, stderr, status} <=#=> ...`).
pub struct RunResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: i32,
}

/// Runs `cmd` after clearing it against `policy`, matching spec.md §4.8 /
/// §8 invariant 7 ("security consulted before every exec"). `input`, when
/// given, is piped to the child's stdin before it is read to completion
/// (spec.md §4.8 "input (string) is piped to stdin").
pub fn run(cmd: &Command, policy: Option<&SecurityPolicy>, input: Option<&[u8]>) -> Result<RunResult, RuntimeError> {
    if let Some(policy) = policy {
        policy.check_execute(&cmd.program)?;
    }

    let mut proc = std::process::Command::new(&cmd.program);
    proc.args(&cmd.args);
    proc.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });
    proc.stdout(Stdio::piped());
    proc.stderr(Stdio::piped());
    if let Some(cwd) = &cmd.cwd {
        proc.current_dir(cwd);
    }
    for (k, v) in &cmd.env {
        proc.env(k, v);
    }

    let mut child = proc
        .spawn()
        .map_err(|e| RuntimeError::io_failure(format!("failed to spawn `{}`: {e}", cmd.program)))?;

    if let Some(bytes) = input {
        use std::io::Write;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin
            .write_all(bytes)
            .map_err(|e| RuntimeError::io_failure(format!("failed writing to subprocess stdin: {e}")))?;
        drop(stdin);
    }

    let output = if let Some(timeout) = cmd.timeout {
        wait_with_timeout(&mut child, timeout)?
    } else {
        child
            .wait_with_output()
            .map_err(|e| RuntimeError::io_failure(format!("subprocess failed: {e}")))?
    };

    Ok(RunResult {
        stdout: output.stdout,
        stderr: output.stderr,
        status: output.status.code().unwrap_or(-1),
    })
}

fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Result<std::process::Output, RuntimeError> {
    let start = std::time::Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => {
                return child
                    .wait_with_output()
                    .map_err(|e| RuntimeError::io_failure(format!("subprocess failed: {e}")));
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    return Err(RuntimeError::io_failure("subprocess timed out"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(RuntimeError::io_failure(format!("subprocess wait failed: {e}"))),
        }
    }
}

pub fn result_to_dict(result: RunResult) -> Dict {
    let mut dict = Dict::new();
    dict.insert("stdout", Value::String(String::from_utf8_lossy(&result.stdout).to_string()));
    dict.insert("stderr", Value::String(String::from_utf8_lossy(&result.stderr).to_string()));
    dict.insert("exitCode", Value::Integer(result.status as i64));
    dict.insert("error", Value::Null);
    dict
}
