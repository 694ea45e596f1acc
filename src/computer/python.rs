//! Session-scoped persistent Python interpreter
//!
//! One interpreter process lives for the whole agent session so that
//! variables defined by one code block are visible to the next. The host
//! talks to it over stdin/stdout with one JSON object per line:
//!
//! ```text
//! host → {"code": "x = 2\nprint(x)"}
//! host ← {"output": "2\n", "error": null}
//! ```
//!
//! The interpreter is started lazily on first use and restarted after a
//! timeout or crash (losing its variables).

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Driver loop run inside the interpreter.
///
/// Replies go out on a private duplicate of the original stdout pipe. File
/// descriptor 1 is pointed at a scratch file, so output written by child
/// processes or C extensions is captured with the block's own prints instead
/// of corrupting the protocol. Code reads an empty stdin so it cannot consume
/// protocol lines.
const REPL_DRIVER: &str = r#"
import io, json, os, sys, tempfile

_requests = sys.stdin
_replies = os.fdopen(os.dup(1), "w")
_capture = tempfile.TemporaryFile(buffering=0)
os.dup2(_capture.fileno(), 1)
_stdout = open(1, "w", buffering=1, closefd=False)
sys.stdin = io.StringIO()
_namespace = {"__name__": "__main__"}

while True:
    _line = _requests.readline()
    if not _line:
        break
    _request = json.loads(_line)
    _capture.seek(0)
    _capture.truncate()
    sys.stdout = _stdout
    _error = None
    try:
        exec(_request.get("code", ""), _namespace)
    except BaseException as e:
        _error = str(e) or type(e).__name__
    try:
        sys.stdout.flush()
    except BaseException:
        pass
    sys.stdout = _stdout
    _stdout.flush()
    _capture.seek(0)
    _output = _capture.read().decode("utf-8", "replace")
    _replies.write(json.dumps({"output": _output, "error": _error}) + "\n")
    _replies.flush()
"#;

#[derive(Serialize)]
struct ExecRequest<'a> {
    code: &'a str,
}

/// What one code block printed, plus the fault message if it raised
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PythonOutput {
    pub output: String,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PythonError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("python session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("python session exited unexpectedly; its variables were lost")]
    Exited,

    #[error("invalid reply from python session: {0}")]
    Protocol(String),

    #[error(
        "execution timed out after {limit:?}; the Python session was restarted and its variables were lost"
    )]
    TimedOut { limit: Duration },
}

struct PythonRepl {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PythonRepl {
    fn start(command: &str) -> Result<Self, PythonError> {
        let mut cmd = Command::new(command);
        cmd.arg("-u")
            .arg("-c")
            .arg(REPL_DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // keep terminal Ctrl-C away from the interpreter
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|source| PythonError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(PythonError::Exited)?;
        let stdout = child.stdout.take().ok_or(PythonError::Exited)?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn exec(&mut self, code: &str) -> Result<PythonOutput, PythonError> {
        let mut line = serde_json::to_vec(&ExecRequest { code })
            .map_err(|e| PythonError::Protocol(e.to_string()))?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;

        let mut reply = String::new();
        if self.stdout.read_line(&mut reply).await? == 0 {
            return Err(PythonError::Exited);
        }
        serde_json::from_str(reply.trim()).map_err(|e| PythonError::Protocol(e.to_string()))
    }

    async fn shutdown(mut self) {
        let _ = self.stdin.shutdown().await;
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

/// Persistent evaluation environment owned by exactly one session
pub struct PythonSession {
    command: String,
    repl: Option<PythonRepl>,
}

impl PythonSession {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            repl: None,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether an interpreter process is currently alive for this session
    pub fn is_running(&self) -> bool {
        self.repl.is_some()
    }

    /// Run `code` in the shared namespace, waiting at most `limit`.
    ///
    /// Python-level faults come back inside [`PythonOutput::error`]; an `Err`
    /// means the interpreter itself failed and has been discarded.
    pub async fn run(&mut self, code: &str, limit: Duration) -> Result<PythonOutput, PythonError> {
        let mut repl = match self.repl.take() {
            Some(repl) => repl,
            None => {
                debug!(command = %self.command, "starting python session");
                PythonRepl::start(&self.command)?
            }
        };

        match timeout(limit, repl.exec(code)).await {
            Ok(Ok(output)) => {
                self.repl = Some(repl);
                Ok(output)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "python session failed, discarding it");
                repl.shutdown().await;
                Err(e)
            }
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "python execution timed out, restarting session");
                repl.shutdown().await;
                Err(PythonError::TimedOut { limit })
            }
        }
    }

    /// Stop the interpreter; the next `run` starts a fresh one
    pub async fn shutdown(&mut self) {
        if let Some(repl) = self.repl.take() {
            repl.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::process::is_available;

    const LIMIT: Duration = Duration::from_secs(10);

    fn python() -> Option<PythonSession> {
        is_available("python3", "--version").then(|| PythonSession::new("python3"))
    }

    #[tokio::test]
    async fn test_variables_persist_between_runs() {
        let Some(mut session) = python() else { return };
        let first = session.run("x = 40", LIMIT).await.unwrap();
        assert_eq!(first.output, "");
        let second = session.run("print(x + 2)", LIMIT).await.unwrap();
        assert_eq!(second.output, "42\n");
        assert!(second.error.is_none());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_fault_keeps_partial_output() {
        let Some(mut session) = python() else { return };
        let out = session
            .run("print('before')\nraise ValueError('bad value')", LIMIT)
            .await
            .unwrap();
        assert_eq!(out.output, "before\n");
        assert_eq!(out.error.as_deref(), Some("bad value"));
        assert!(session.is_running());
    }

    #[tokio::test]
    async fn test_exit_does_not_kill_session() {
        let Some(mut session) = python() else { return };
        session.run("y = 1", LIMIT).await.unwrap();
        let out = session.run("import sys\nsys.exit(3)", LIMIT).await.unwrap();
        assert_eq!(out.error.as_deref(), Some("3"));
        let out = session.run("print(y)", LIMIT).await.unwrap();
        assert_eq!(out.output, "1\n");
    }

    #[tokio::test]
    async fn test_input_does_not_read_protocol() {
        let Some(mut session) = python() else { return };
        let out = session.run("input()", LIMIT).await.unwrap();
        assert!(out.error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_restarts_session() {
        let Some(mut session) = python() else { return };
        session.run("z = 5", LIMIT).await.unwrap();
        let err = session
            .run("import time\ntime.sleep(5)", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, PythonError::TimedOut { .. }));
        assert!(!session.is_running());

        let out = session.run("print('z' in globals())", LIMIT).await.unwrap();
        assert_eq!(out.output, "False\n");
    }

    #[tokio::test]
    async fn test_child_process_output_is_captured() {
        let Some(mut session) = python() else { return };
        session.run("kept = 7", LIMIT).await.unwrap();

        let out = session
            .run("import os\nprint('before')\nos.system('echo hi')\nprint('after')", LIMIT)
            .await
            .unwrap();
        assert_eq!(out.output, "before\nhi\nafter\n");
        assert!(out.error.is_none());
        assert!(session.is_running());

        let out = session.run("print(kept)", LIMIT).await.unwrap();
        assert_eq!(out.output, "7\n");
    }

    #[tokio::test]
    async fn test_interrupt_keeps_session() {
        let Some(mut session) = python() else { return };
        session.run("kept = 7", LIMIT).await.unwrap();

        let out = session.run("raise KeyboardInterrupt", LIMIT).await.unwrap();
        assert_eq!(out.error.as_deref(), Some("KeyboardInterrupt"));

        let out = session.run("print(kept)", LIMIT).await.unwrap();
        assert_eq!(out.output, "7\n");
    }

    #[test]
    fn test_error_texts_mention_lost_state() {
        let err = PythonError::TimedOut {
            limit: Duration::from_millis(300),
        };
        assert_eq!(
            err.to_string(),
            "execution timed out after 300ms; the Python session was restarted and its variables were lost"
        );
        assert!(PythonError::Exited.to_string().contains("variables were lost"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let mut session = PythonSession::new("mindflow-no-such-python");
        let err = session.run("print(1)", LIMIT).await.unwrap_err();
        assert!(matches!(err, PythonError::Spawn { .. }));
    }
}
