use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::io;
use std::process::{Command, ExitStatus, Output, Stdio};

use log::Level::Debug;
use log::{debug, log_enabled};

pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    /// Converts to a `Result` object that is `Ok` only if the [ExitStatus] is
    /// success.
    pub fn err_on_status(self) -> crate::Result<Self> {
        if self.status.success() {
            return Ok(self);
        }

        // Killed by a signal if there's no code
        let code = self.status.code().unwrap_or(-1);

        Err(crate::Error::CommandError(
            code,
            self.stderr_utf8_lossy().trim().to_string(),
        ))
    }

    #[inline]
    pub fn ok(&self) -> bool {
        self.status.success()
    }

    #[inline]
    pub fn stdout_utf8_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    #[inline]
    pub fn stderr_utf8_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

impl From<Output> for CmdOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Runs external programs. Exists so callers can be tested without spawning
/// anything.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str, args: &[OsString]) -> io::Result<CmdOutput>;
}

/// Runs commands as child processes
pub struct ExecRunner;

impl CommandRunner for ExecRunner {
    fn run(&self, cmd: &str, args: &[OsString]) -> io::Result<CmdOutput> {
        run_cmd(cmd, args)
    }
}

/// Splits a string for use as a shell command
pub fn split(s: &str) -> Option<Vec<String>> {
    let mut escaped = false;
    let mut single_quote = false;
    let mut double_quote = false;

    let mut into = String::new();

    let mut sp = Vec::new();

    for c in s.chars() {
        if escaped {
            escaped = false;
            into.push(c);
            continue;
        }

        match c {
            '\\' if !single_quote => escaped = true,
            '\'' if !double_quote => single_quote = !single_quote,
            '"' if !single_quote => double_quote = !double_quote,
            c if c.is_whitespace() && !(single_quote || double_quote) => {
                if !into.is_empty() {
                    sp.push(std::mem::take(&mut into));
                }
            }
            c => into.push(c),
        }
    }

    if escaped | single_quote | double_quote {
        return None;
    }

    if !into.is_empty() {
        sp.push(into);
    }

    Some(sp)
}

pub fn run_cmd<C, S>(cmd: C, args: &[S]) -> io::Result<CmdOutput>
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    if log_enabled!(Debug) {
        log_cmd(&cmd, args);
    }
    Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map(|output| output.into())
}

pub fn log_cmd<C, S>(cmd: &C, args: &[S])
where
    C: AsRef<OsStr>,
    S: AsRef<OsStr>,
{
    let args_string = args
        .iter()
        .map(|it| it.as_ref().to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    if args_string.is_empty() {
        debug!("Running command: `{}`", cmd.as_ref().to_string_lossy());
    } else {
        debug!(
            "Running command: `{} {}`",
            cmd.as_ref().to_string_lossy(),
            args_string
        );
    }
}
