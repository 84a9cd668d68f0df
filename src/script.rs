//! Running provisioning scripts and reading back their results.
//!
//! Provisioning scripts report a result (an id, a list of names) through a
//! side channel instead of stdout, so progress chatter on stdout never mixes
//! with the value. The runner reserves a fresh temporary file, appends its
//! path as the last argument, and reads the file after a zero exit:
//!
//! ```text
//! ./create_backup.sh <namespace> <vault> /tmp/provcheck-out-XXXXXX
//!                                        └── script writes its result here
//! ```
//!
//! The file is removed on every exit path. stdout and stderr of the script
//! are forwarded line by line to the case log; the last lines are kept so a
//! failure message shows what the script said before it died.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::log::CaseLog;

/// Prefix of the side-channel files.
pub const OUTPUT_FILE_PREFIX: &str = "provcheck-out-";

/// Number of output lines kept for error messages.
pub const TAIL_LINES: usize = 20;

/// Errors from running a script.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed with {status}{}", format_tail(.tail))]
    Failed {
        program: String,
        status: ExitStatus,
        tail: Vec<String>,
    },

    #[error("{program} was killed: run cancelled")]
    Cancelled { program: String },

    #[error("Failed to reserve output file: {0}")]
    OutputFile(#[source] std::io::Error),

    #[error("Failed to read output of {program}: {source}")]
    ReadOutput {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- last output ---\n{}", tail.join("\n"))
    }
}

#[derive(Debug, Clone)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Runs scripts on behalf of one test case.
///
/// Cheap to clone. Scripts never time out on their own: the child is killed
/// when the cancellation token fires or when the running future is dropped
/// (for example by a retrier reaching its deadline).
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    log: CaseLog,
    cancel: CancellationToken,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ScriptRunner {
    pub fn new(log: CaseLog) -> Self {
        Self {
            log,
            cancel: CancellationToken::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for every script.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Runs `program args... <output path>` and returns what it wrote there.
    ///
    /// A single trailing newline is trimmed. A script that exits 0 without
    /// writing (or after deleting the file) yields an empty string.
    ///
    /// # Errors
    ///
    /// - `ScriptError::Failed` - non-zero exit; the output file is not read
    /// - `ScriptError::Cancelled` - the case was cancelled and the child killed
    pub async fn run_capturing_output<I, S>(
        &self,
        program: &str,
        args: I,
    ) -> Result<String, ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let output_path = tempfile::Builder::new()
            .prefix(OUTPUT_FILE_PREFIX)
            .tempfile()
            .map_err(ScriptError::OutputFile)?
            .into_temp_path();

        let mut args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        args.push(output_path.to_string_lossy().into_owned());

        // On error the TempPath is dropped here, which removes the file.
        self.exec(program, &args).await?;

        let result = read_output(&output_path).await;

        if let Err(e) = output_path.close()
            && e.kind() != ErrorKind::NotFound
        {
            warn!(case = %self.log.case(), "Failed to remove output file: {}", e);
            self.log.line(format!("failed to remove output file: {}", e));
        }

        result.map_err(|source| ScriptError::ReadOutput {
            program: program.to_string(),
            source,
        })
    }

    /// Runs `program args...` for its exit code only.
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<(), ScriptError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        self.exec(program, &args).await
    }

    /// Relative program paths with a separator resolve against the
    /// working directory.
    fn resolve_program(&self, program: &str) -> PathBuf {
        let path = Path::new(program);
        match &self.working_dir {
            Some(dir) if path.is_relative() && program.contains('/') => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn exec(&self, program: &str, args: &[String]) -> Result<(), ScriptError> {
        let mut cmd = tokio::process::Command::new(self.resolve_program(program));
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let display = std::iter::once(program)
            .chain(args.iter().map(|a| a.as_str()))
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        self.log.line(format!("exec: {}", display));

        let mut child = cmd.spawn().map_err(|source| ScriptError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ScriptError::Spawn {
            program: program.to_string(),
            source: std::io::Error::other("stdout not captured"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ScriptError::Spawn {
            program: program.to_string(),
            source: std::io::Error::other("stderr not captured"),
        })?;

        let stdout_stream = SplitStream::new(BufReader::new(stdout).split(b'\n'))
            .map(|line| OutputLine::Stdout(decode_line(line)));
        let stderr_stream = SplitStream::new(BufReader::new(stderr).split(b'\n'))
            .map(|line| OutputLine::Stderr(decode_line(line)));
        let mut output = stream::select(stdout_stream, stderr_stream);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);
        let waited = {
            let drain = async {
                while let Some(line) = output.next().await {
                    let text = match line {
                        OutputLine::Stdout(s) => s,
                        OutputLine::Stderr(s) => format!("stderr: {}", s),
                    };
                    self.log.line(format!("[{}] {}", program, text));
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(text);
                }
                child.wait().await
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                status = drain => Some(status),
            }
        };

        match waited {
            None => {
                if let Err(e) = child.kill().await {
                    warn!(case = %self.log.case(), "Failed to kill {}: {}", program, e);
                }
                self.log.line(format!("{}: killed after cancellation", program));
                Err(ScriptError::Cancelled {
                    program: program.to_string(),
                })
            }
            Some(Err(source)) => Err(ScriptError::Wait {
                program: program.to_string(),
                source,
            }),
            Some(Ok(status)) if !status.success() => {
                self.log.line(format!("{}: {}", program, status));
                Err(ScriptError::Failed {
                    program: program.to_string(),
                    status,
                    tail: tail.into_iter().collect(),
                })
            }
            Some(Ok(_)) => Ok(()),
        }
    }
}

/// Decodes one raw output line; invalid UTF-8 is replaced, not dropped.
fn decode_line(line: std::io::Result<Vec<u8>>) -> String {
    match line {
        Ok(mut bytes) => {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Err(e) => format!("<unreadable output: {}>", e),
    }
}

async fn read_output(path: &Path) -> std::io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(mut content) => {
            if content.ends_with('\n') {
                content.pop();
                if content.ends_with('\r') {
                    content.pop();
                }
            }
            Ok(content)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Splits a list result on whitespace, dropping empty entries.
///
/// ```
/// use provcheck::script::parse_list;
///
/// assert_eq!(parse_list("b1\nb2 b3\n\n"), vec!["b1", "b2", "b3"]);
/// assert!(parse_list("").is_empty());
/// ```
pub fn parse_list(output: &str) -> Vec<String> {
    output.split_whitespace().map(str::to_string).collect()
}
