//! External command execution
//!
//! Commands are always launched as a program plus an argument vector, never through a shell.
//! Stdin is closed so a tool waiting for interactive input fails instead of hanging, and every
//! invocation carries a deadline after which the child is killed.

use async_trait::async_trait;
use std::{process::Stdio, time::{Duration, Instant}};
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::error::{ReconError, Result};

/// A single invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<P: Into<String>>(program: P, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line, used for audit records
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Executes external commands
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the command to completion, whatever its exit status.
    ///
    /// Errors only when the program cannot be launched or exceeds its deadline.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run the command and treat a non-zero exit status as a failure
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec).await?;
        if output.success() {
            Ok(output)
        } else {
            let detail = output.stderr.trim();
            Err(ReconError::subprocess(
                spec.display(),
                format!(
                    "exited with status {}{}",
                    output
                        .status_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    if detail.is_empty() { String::new() } else { format!(": {}", detail) }
                ),
            ))
        }
    }
}

/// Runs commands with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let started = Instant::now();
        debug!(command = %spec.display(), "Executing external command");

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ReconError::subprocess(&spec.program, format!("failed to launch: {}", e)))?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ReconError::subprocess(&spec.program, format!("wait failed: {}", e)));
            }
            Err(_) => {
                warn!(command = %spec.display(), "Command exceeded {:?}, killed", spec.timeout);
                return Err(ReconError::subprocess_timeout(spec.display(), spec.timeout.as_secs()));
            }
        };

        Ok(CommandOutput {
            status_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: started.elapsed(),
        })
    }
}

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '$', '`', '<', '>', '(', ')', '{', '}', '[', ']', '!', '*', '?', '~', '\'', '"',
    '\\', '\n', '\r',
];

/// Strip shell metacharacters and whitespace from a user-supplied target or interface name
pub fn sanitize_argument(raw: &str) -> String {
    raw.chars()
        .filter(|c| !SHELL_METACHARACTERS.contains(c) && !c.is_whitespace())
        .collect()
}

/// Capture filters legitimately contain spaces and a few operators, but never shell syntax
pub fn sanitize_filter(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ';' | '&' | '|' | '$' | '`' | '<' | '>' | '\\' | '\'' | '"' | '\n' | '\r'))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Scripted stand-in for external tools, shared by the scan pipeline tests
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    enum Reply {
        Exit { code: i32, stdout: String },
        Timeout,
    }

    struct Rule {
        program: String,
        with_args: Vec<String>,
        reply: Reply,
    }

    /// Answers commands by matching the program and a subset of its arguments; first rule wins
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Vec<Rule>,
        calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, program: &str, with_args: &[&str], stdout: &str) -> Self {
            self.rule(program, with_args, Reply::Exit { code: 0, stdout: stdout.to_string() })
        }

        pub fn fail(self, program: &str, with_args: &[&str], code: i32) -> Self {
            self.rule(program, with_args, Reply::Exit { code, stdout: String::new() })
        }

        pub fn time_out(self, program: &str, with_args: &[&str]) -> Self {
            self.rule(program, with_args, Reply::Timeout)
        }

        fn rule(mut self, program: &str, with_args: &[&str], reply: Reply) -> Self {
            self.rules.push(Rule {
                program: program.to_string(),
                with_args: with_args.iter().map(|a| a.to_string()).collect(),
                reply,
            });
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessRunner for ScriptedRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec.clone());
            let rule = self.rules.iter().find(|rule| {
                rule.program == spec.program && rule.with_args.iter().all(|a| spec.args.contains(a))
            });
            match rule.map(|r| &r.reply) {
                Some(Reply::Exit { code, stdout }) => Ok(CommandOutput {
                    status_code: Some(*code),
                    stdout: stdout.clone(),
                    stderr: String::new(),
                    duration: Duration::from_millis(1),
                }),
                Some(Reply::Timeout) => Err(ReconError::subprocess_timeout(spec.display(), spec.timeout.as_secs())),
                None => Ok(CommandOutput {
                    status_code: Some(1),
                    stdout: String::new(),
                    stderr: "no scripted reply".to_string(),
                    duration: Duration::from_millis(1),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_metacharacters() {
        assert_eq!(sanitize_argument("192.168.1.0/24; rm -rf /"), "192.168.1.0/24rm-rf/");
        assert_eq!(sanitize_argument("$(reboot)10.0.0.1"), "reboot10.0.0.1");
        assert_eq!(sanitize_argument("eth0"), "eth0");
    }

    #[test]
    fn test_sanitize_filter_keeps_words() {
        assert_eq!(sanitize_filter("tcp port 80 && `id`"), "tcp port 80 id");
        assert_eq!(sanitize_filter("  net   10.0.0.0/8 "), "net 10.0.0.0/8");
    }

    #[test]
    fn test_command_display() {
        let spec = CommandSpec::new("nmap", Duration::from_secs(5))
            .args(["-sn", "-T4"])
            .arg("10.0.0.0/24");
        assert_eq!(spec.display(), "nmap -sn -T4 10.0.0.0/24");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_captures_output() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("echo", Duration::from_secs(5)).arg("hello");
        let output = runner.run(&spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runner_kills_on_timeout() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("sleep", Duration::from_millis(100)).arg("5");
        let started = Instant::now();
        let error = runner.run(&spec).await.unwrap_err();
        assert!(matches!(error, ReconError::SubprocessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_runner_reports_missing_program() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Duration::from_secs(1));
        let error = runner.run(&spec).await.unwrap_err();
        assert!(matches!(error, ReconError::Subprocess { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_checked_rejects_failure() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("false", Duration::from_secs(5));
        assert!(runner.run_checked(&spec).await.is_err());
    }
}
