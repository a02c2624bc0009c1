//! The process-launch primitive shared by the parser (backtick and pipe
//! includes) and the scheduler (recipes). Everything else in the workspace
//! talks to child processes through `subprocess`.

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("cannot launch {program}: {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },
    #[error("waiting on {program} failed: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
}

/// Run `program` with `args`, feeding `input` to its standard input as a
/// single write.
///
/// When `capture_out` is true the child's standard output is collected and
/// returned; otherwise it passes through to our own. Standard error always
/// passes through. The returned flag is true iff the child exited with
/// status 0.
pub fn subprocess(
    program: &str,
    args: &[String],
    input: &str,
    capture_out: bool,
) -> Result<(String, bool), SpawnError> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::piped());
    if capture_out {
        cmd.stdout(Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
        program: program.to_owned(),
        source,
    })?;

    // The writer runs on its own thread so a child that fills its output
    // pipe before draining stdin cannot wedge us. A child that exits
    // without reading its input is not an error.
    let writer = child.stdin.take().map(|mut pipe| {
        let input = input.to_owned();
        thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        })
    });

    let output = child
        .wait_with_output()
        .map_err(|source| SpawnError::Wait {
            program: program.to_owned(),
            source,
        })?;
    if let Some(handle) = writer {
        let _ = handle.join();
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    Ok((stdout, output.status.success()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_capture() {
        let (out, ok) = subprocess("sh", &["-c".into(), "echo hello".into()], "", true)
            .expect("spawn sh");
        assert!(ok);
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_stdin_is_piped() {
        let (out, ok) = subprocess("sh", &[], "echo from stdin", true).expect("spawn sh");
        assert!(ok);
        assert_eq!(out, "from stdin\n");
    }

    #[test]
    fn test_failure_exit_code() {
        let (out, ok) = subprocess("sh", &["-c".into(), "exit 3".into()], "", true)
            .expect("spawn sh");
        assert!(!ok);
        assert_eq!(out, "");
    }

    #[test]
    fn test_missing_program() {
        let err = subprocess("definitely-not-a-real-program", &[], "", true).unwrap_err();
        assert!(matches!(err, SpawnError::Launch { .. }));
    }

    #[test]
    fn test_no_capture_returns_empty() {
        let (out, ok) = subprocess("sh", &["-c".into(), "true".into()], "", false)
            .expect("spawn sh");
        assert!(ok);
        assert_eq!(out, "");
    }
}
