//! Argument-vector subprocess execution with a wall-clock limit
//!
//! The code block is passed as a single argument (`bash -c <code>`), never
//! spliced into a shell string.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;

/// Exit status of a finished command
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, or -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub duration_ms: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("execution timed out after {limit:?}")]
    TimedOut { limit: Duration },
}

/// Run `program args..` to completion, killing it once `limit` elapses.
///
/// Standard output and error go straight to the terminal; stdin is closed so
/// code waiting on input fails fast instead of hanging the agent. On unix the
/// command runs in its own process group, out of reach of terminal signals.
pub async fn run_command(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    // Ctrl-C cancels between rounds; it must not reach the running command
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        }),
        Ok(Err(source)) => Err(ProcessError::Wait {
            program: program.to_string(),
            source,
        }),
        Err(_) => {
            let _ = child.kill().await;
            Err(ProcessError::TimedOut { limit })
        }
    }
}

/// Whether `program` can be launched at all (used to skip tests and to
/// report missing interpreters)
pub fn is_available(program: &str, check_arg: &str) -> bool {
    std::process::Command::new(program)
        .arg(check_arg)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}
