use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    process::{Command, ExitStatus, Stdio},
};

use log::trace;
use thiserror::Error;

/// Exit code git uses for "object does not exist" and similar fatal
/// conditions whose stderr text callers inspect.
pub const GIT_FATAL_EXIT: i32 = 128;

#[derive(Error, Debug)]
pub enum GitCliError {
    #[error("failed to start 'git {}': {source}", args.join(" "))]
    Spawn {
        args: Vec<String>,
        source: io::Error,
    },
    #[error("'git {}' {}: {}", args.join(" "), describe_status(.status), stderr.trim())]
    Failed {
        args: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

impl GitCliError {
    /// Whether the child exited on its own (as opposed to dying on a
    /// signal). Expected non-zero exits drive control flow; signal
    /// deaths always propagate.
    pub fn exited(&self) -> bool {
        match self {
            GitCliError::Failed { status, .. } => status.code().is_some(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitCliError::Failed { status, .. } => status.code(),
            _ => None,
        }
    }
}

fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "was killed by a signal".to_string(),
    }
}

/// Outcome of an unchecked invocation; callers classify the status
/// themselves.
#[derive(Debug)]
pub struct GitOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Driver for the external `git` executable. Arguments are passed as an
/// explicit vector; no shell is involved.
#[derive(Debug, Clone, Default)]
pub struct Git {
    env: Vec<(String, String)>,
}

impl Git {
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver that overrides environment variables for every
    /// invocation, notably `LC_ALL=C` when exit messages are parsed.
    pub fn with_env(env: Vec<(String, String)>) -> Self {
        Self { env }
    }

    fn command<I, S>(&self, args: I) -> (Command, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new("git");
        let mut shown = Vec::new();
        for arg in args {
            shown.push(arg.as_ref().to_string_lossy().into_owned());
            cmd.arg(arg.as_ref());
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        trace!("running git {}", shown.join(" "));
        (cmd, shown)
    }

    /// Run and require a zero exit. Stdout is discarded; stderr is
    /// captured into the error on failure.
    pub fn run<I, S>(&self, args: I) -> Result<(), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.output(args).map(|_| ())
    }

    /// Run and require a zero exit, returning captured stdout.
    pub fn output<I, S>(&self, args: I) -> Result<String, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (out, shown) = self.capture(args)?;
        if !out.status.success() {
            return Err(GitCliError::Failed {
                args: shown,
                status: out.status,
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    /// Run without checking the exit status, capturing stdout and
    /// stderr separately.
    pub fn status<I, S>(&self, args: I) -> Result<GitOutput, GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.capture(args).map(|(out, _)| out)
    }

    fn capture<I, S>(&self, args: I) -> Result<(GitOutput, Vec<String>), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut cmd, shown) = self.command(args);
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|source| GitCliError::Spawn {
                args: shown.clone(),
                source,
            })?;
        let out = GitOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        Ok((out, shown))
    }

    /// Run without checking the exit status, with stderr merged into
    /// the captured output so callers can match on git's messages.
    pub fn status_merged<I, S>(&self, args: I) -> Result<(ExitStatus, String), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.status(args)?;
        let mut merged = out.stdout;
        merged.push_str(&out.stderr);
        Ok((out.status, merged))
    }

    /// Run and stream stdout into `sink`, requiring a zero exit. Used
    /// for `git archive`, whose output can be large.
    pub fn stream<I, S>(&self, args: I, sink: &mut dyn Write) -> Result<(), GitCliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (mut cmd, shown) = self.command(args);
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| GitCliError::Spawn {
                args: shown.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().expect("stdout is piped");
        io::copy(&mut stdout, sink)?;

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(GitCliError::Failed {
                args: shown,
                status,
                stderr,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let git = Git::new();
        let out = git.output(["version"]).unwrap();
        assert!(out.starts_with("git version"));
    }

    #[test]
    fn nonzero_exit_is_classified() {
        let git = Git::new();
        let err = git
            .output(["rev-parse", "--verify", "refs/definitely/missing"])
            .unwrap_err();
        assert!(err.exited());
        assert!(err.exit_code().is_some());
    }

    #[test]
    fn status_does_not_fail_on_nonzero() {
        let git = Git::new();
        let out = git
            .status(["cat-file", "-e", "0000000000000000000000000000000000000000"])
            .unwrap();
        assert!(!out.success());
    }
}
