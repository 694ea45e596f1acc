//! Computer - routes model-written code to the matching runtime
//!
//! # Dispatch
//!
//! ```text
//! format        runtime                         result text
//! ──────────    ─────────────────────────────   ──────────────────────────────────
//! python        persistent PythonSession        captured stdout (+ error text)
//! bash          bash -c <code>                  "Command executed with exit code: N"
//! shell         sh -c / cmd /C <code>           "Command executed with exit code: N"
//! cmd           cmd /C <code>        (Windows)  "Command executed with exit code: N"
//! powershell    powershell -Command  (Windows)  "Command executed with exit code: N"
//! applescript   osascript -e         (macOS)    "Command executed with exit code: N"
//! js            node -e <code>                  "Command executed with exit code: N"
//! pseudocode    shown, never run                plan notice
//! anything else nothing launched                "does not support the format" notice
//! ```
//!
//! Every path resolves to exactly one text value; faults never escape
//! [`Computer::execute`].

pub mod process;
pub mod python;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::metrics::{CODE_EXECUTIONS, CODE_EXECUTION_DURATION};
use process::{run_command, ProcessError};
use python::{PythonError, PythonSession};

/// Substituted when a run printed nothing, so the model can tell "ran
/// silently" apart from "did not run"
pub const NO_OUTPUT_PLACEHOLDER: &str =
    "The following code did not generate any console text output, but may generate other output.";

/// Fed back for `pseudocode` blocks
pub const PLAN_NOTICE: &str = "The plan was shown to the user; pseudocode is not executed.";

/// Fed back when the approver refuses a block
pub const DECLINED_NOTICE: &str = "The user declined to run this code.";

/// Host operating system family, used for capability gating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            _ => Platform::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "Linux",
            Platform::MacOs => "macOS",
            Platform::Windows => "Windows",
            Platform::Other => std::env::consts::OS,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A language tag the computer knows how to handle.
///
/// Tags are matched case-sensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    Bash,
    Shell,
    Cmd,
    PowerShell,
    AppleScript,
    JavaScript,
    Pseudocode,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::Python,
        Language::Bash,
        Language::Shell,
        Language::Cmd,
        Language::PowerShell,
        Language::AppleScript,
        Language::JavaScript,
        Language::Pseudocode,
    ];

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.tag() == tag)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Bash => "bash",
            Language::Shell => "shell",
            Language::Cmd => "cmd",
            Language::PowerShell => "powershell",
            Language::AppleScript => "applescript",
            Language::JavaScript => "js",
            Language::Pseudocode => "pseudocode",
        }
    }

    pub fn supported_on(&self, platform: Platform) -> bool {
        match self {
            Language::Python | Language::JavaScript | Language::Shell | Language::Pseudocode => {
                true
            }
            Language::Bash => matches!(platform, Platform::Linux | Platform::MacOs),
            Language::Cmd | Language::PowerShell => platform == Platform::Windows,
            Language::AppleScript => platform == Platform::MacOs,
        }
    }

    /// Interpreter and argument vector for languages run as one external
    /// command. `None` for python and pseudocode.
    fn command<'a>(&self, platform: Platform, code: &'a str) -> Option<(&'static str, [&'a str; 2])> {
        let command = match self {
            Language::Bash => ("bash", ["-c", code]),
            Language::Shell if platform == Platform::Windows => ("cmd", ["/C", code]),
            Language::Shell => ("sh", ["-c", code]),
            Language::Cmd => ("cmd", ["/C", code]),
            Language::PowerShell => ("powershell", ["-Command", code]),
            Language::AppleScript => ("osascript", ["-e", code]),
            Language::JavaScript => ("node", ["-e", code]),
            Language::Python | Language::Pseudocode => return None,
        };
        Some(command)
    }
}

/// How an execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Ran to completion without a fault (exit code 0 for commands)
    Completed,
    /// Raised, exited nonzero or could not be launched
    Failed,
    TimedOut,
    /// Unknown format or not available on this platform; nothing launched
    Unsupported,
    /// Pseudocode shown to the user
    Planned,
    /// Refused by the approver
    Declined,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timeout",
            ExecutionStatus::Unsupported => "unsupported",
            ExecutionStatus::Planned => "planned",
            ExecutionStatus::Declined => "declined",
        }
    }
}

/// Record of a single code execution
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Language tag as declared by the model
    pub format: String,
    /// Code that was executed
    pub code: String,
    /// Text fed back into the conversation
    pub output: String,
    pub status: ExecutionStatus,
    /// Exit code for external commands that finished
    pub exit_code: Option<i32>,
    /// Execution duration in milliseconds
    pub duration_ms: f64,
}

/// Decides whether a code block may run when auto-run is off
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, format: &str, code: &str) -> bool;
}

/// Refuses everything; used when auto-run is off and nobody can be asked
pub struct DeclineAll;

#[async_trait]
impl Approver for DeclineAll {
    async fn approve(&self, _format: &str, _code: &str) -> bool {
        false
    }
}

pub fn error_text(message: impl fmt::Display) -> String {
    format!("An error occurred: {}", message)
}

pub fn exit_code_text(code: i32) -> String {
    format!("Command executed with exit code: {}", code)
}

pub fn unsupported_format_text(format: &str) -> String {
    format!("MindFlow does not support the format: {}", format)
}

pub fn unsupported_platform_text(format: &str, platform: Platform) -> String {
    format!("The format `{}` is not supported on {}.", format, platform)
}

/// Execution dispatcher owned by one agent session
pub struct Computer {
    platform: Platform,
    python: PythonSession,
    timeout: Duration,
    approver: Option<Arc<dyn Approver>>,
    display: bool,
}

impl Computer {
    /// Create a computer for the current host
    ///
    /// # Arguments
    /// * `python_command` - interpreter used for the persistent python session
    /// * `timeout` - wall-clock limit for every execution
    pub fn new(python_command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            platform: Platform::current(),
            python: PythonSession::new(python_command),
            timeout,
            approver: None,
            display: true,
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Ask `approver` before running anything
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Skip the pre-execution code display on stdout
    pub fn quiet(mut self) -> Self {
        self.display = false;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn has_approver(&self) -> bool {
        self.approver.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Language tags that can run on this host, in a stable order
    pub fn supported_formats(&self) -> Vec<&'static str> {
        Language::ALL
            .into_iter()
            .filter(|lang| *lang != Language::Pseudocode && lang.supported_on(self.platform))
            .map(|lang| lang.tag())
            .collect()
    }

    /// Execute `code` declared as `format` and normalize the outcome to text.
    pub async fn execute(&mut self, code: &str, format: &str) -> ExecutionRecord {
        let start = Instant::now();
        let language = Language::from_tag(format);

        self.announce(code, format, language == Some(Language::Pseudocode));
        info!(format, code_len = code.len(), "executing code");

        let (status, output, exit_code) = self.dispatch(code, format, language).await;

        let output = if output.is_empty() {
            NO_OUTPUT_PLACEHOLDER.to_string()
        } else {
            output
        };

        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        let label = language.map(|l| l.tag()).unwrap_or("unknown");
        CODE_EXECUTIONS.with_label_values(&[label, status.as_str()]).inc();
        CODE_EXECUTION_DURATION
            .with_label_values(&[label])
            .observe(duration_ms / 1000.0);

        info!(format, status = status.as_str(), exit_code, duration_ms, "execution finished");

        ExecutionRecord {
            format: format.to_string(),
            code: code.to_string(),
            output,
            status,
            exit_code,
            duration_ms,
        }
    }

    async fn dispatch(
        &mut self,
        code: &str,
        format: &str,
        language: Option<Language>,
    ) -> (ExecutionStatus, String, Option<i32>) {
        let Some(language) = language else {
            warn!(format, "unsupported code format");
            return (ExecutionStatus::Unsupported, unsupported_format_text(format), None);
        };

        if !language.supported_on(self.platform) {
            warn!(format, platform = %self.platform, "format not available on this platform");
            return (
                ExecutionStatus::Unsupported,
                unsupported_platform_text(format, self.platform),
                None,
            );
        }

        if language == Language::Pseudocode {
            return (ExecutionStatus::Planned, PLAN_NOTICE.to_string(), None);
        }

        if let Some(approver) = &self.approver {
            if !approver.approve(format, code).await {
                info!(format, "execution declined");
                return (ExecutionStatus::Declined, DECLINED_NOTICE.to_string(), None);
            }
        }

        match language.command(self.platform, code) {
            Some((program, args)) => self.run_external(program, &args).await,
            None => self.run_python(code).await,
        }
    }

    async fn run_python(&mut self, code: &str) -> (ExecutionStatus, String, Option<i32>) {
        match self.python.run(code, self.timeout).await {
            Ok(out) => match out.error {
                None => (ExecutionStatus::Completed, out.output, None),
                Some(fault) => (
                    ExecutionStatus::Failed,
                    format!("{}{}", out.output, error_text(fault)),
                    None,
                ),
            },
            Err(e @ PythonError::TimedOut { .. }) => (ExecutionStatus::TimedOut, error_text(e), None),
            Err(e) => (ExecutionStatus::Failed, error_text(e), None),
        }
    }

    async fn run_external(&self, program: &str, args: &[&str]) -> (ExecutionStatus, String, Option<i32>) {
        match run_command(program, args, self.timeout).await {
            Ok(out) => {
                let status = if out.exit_code == 0 {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                };
                (status, exit_code_text(out.exit_code), Some(out.exit_code))
            }
            Err(e @ ProcessError::TimedOut { .. }) => (ExecutionStatus::TimedOut, error_text(e), None),
            Err(e) => (ExecutionStatus::Failed, error_text(e), None),
        }
    }

    /// Show the code and its declared language before anything runs
    fn announce(&self, code: &str, format: &str, plan: bool) {
        if !self.display {
            return;
        }
        if plan {
            println!("[COMPUTER] Task plan in `{}`:", format);
        } else {
            println!("[COMPUTER] Running `{}`:", format);
        }
        println!("┌─────────────────────────────────────────");
        for line in code.lines() {
            println!("│ {}", line);
        }
        println!("└─────────────────────────────────────────");
    }

    /// Stop the session's python interpreter
    pub async fn shutdown(&mut self) {
        self.python.shutdown().await;
    }
}
