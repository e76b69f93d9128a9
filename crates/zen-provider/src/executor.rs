use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use zen_core::{Context, ErrorCode, ExecResult, Result, ZenError};

use crate::stream::OutputStream;

/// Variables copied from the parent environment on every call.
pub const BASE_ALLOWLIST: &[&str] = &["PATH"];

/// Flags whose following argument is a secret.
const SENSITIVE_FLAGS: &[&str] = &[
    "--password",
    "-p",
    "--token",
    "-t",
    "--secret",
    "-s",
    "--key",
    "-k",
    "--api-key",
    "--auth",
];

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Inherited from the parent process when unset.
    pub work_dir: Option<PathBuf>,
    /// Explicit variables, applied after the allowlist.
    pub env: BTreeMap<String, String>,
    /// Extra parent variables to pass through, on top of [`BASE_ALLOWLIST`].
    pub allow_env: Vec<String>,
}

impl ExecOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(dir.into()),
            ..Default::default()
        }
    }
}

/// Runs a known binary with an argv array, never through a shell.
///
/// The child gets a fresh environment: the allowlisted parent variables
/// plus whatever the caller passes explicitly. Cancelling the context (or
/// hitting its deadline) kills and reaps the child.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    allow_env: Vec<String>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra parent variables every call from this executor passes through.
    pub fn with_allowlist<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_env: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Run to completion, buffering both pipes. A non-zero exit code is
    /// returned in the result, not as an error.
    pub async fn execute(
        &self,
        ctx: &Context,
        binary: &Path,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecResult> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        debug!(
            binary = %binary.display(),
            args = ?sanitize_args(args),
            "exec"
        );
        let start = Instant::now();
        let mut cmd = self.command(binary, args, opts);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| spawn_error(binary, e))?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let outcome = {
            let io = async {
                let read_out = async {
                    match stdout.as_mut() {
                        Some(s) => s.read_to_end(&mut out_buf).await.map(|_| ()),
                        None => Ok(()),
                    }
                };
                let read_err = async {
                    match stderr.as_mut() {
                        Some(s) => s.read_to_end(&mut err_buf).await.map(|_| ()),
                        None => Ok(()),
                    }
                };
                match tokio::try_join!(read_out, read_err) {
                    Ok(_) => child.wait().await,
                    Err(e) => Err(e),
                }
            };
            tokio::select! {
                r = io => Some(r),
                _ = ctx.done() => None,
            }
        };

        let status = match outcome {
            Some(r) => r.map_err(|e| {
                ZenError::new(ErrorCode::ExecutionFailed, "waiting on child failed").with_source(e)
            })?,
            None => {
                let _ = child.kill().await;
                debug!(binary = %binary.display(), "child killed on cancel");
                return Err(ctx
                    .err()
                    .unwrap_or_else(|| ZenError::canceled("execution canceled")));
            }
        };

        let duration = start.elapsed();
        let exit_code = status.code().unwrap_or(-1);
        debug!(
            binary = %binary.display(),
            exit_code,
            duration_ms = duration.as_millis() as u64,
            "exec finished"
        );
        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&out_buf).into_owned(),
            stderr: String::from_utf8_lossy(&err_buf).into_owned(),
            duration,
            ..Default::default()
        })
    }

    /// Spawn and return a line reader. The stream owns the child.
    pub async fn stream(
        &self,
        ctx: &Context,
        binary: &Path,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<OutputStream> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        debug!(
            binary = %binary.display(),
            args = ?sanitize_args(args),
            "stream"
        );
        let mut cmd = self.command(binary, args, opts);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| spawn_error(binary, e))?;
        OutputStream::from_child(child, ctx.clone())
    }

    fn command(&self, binary: &Path, args: &[String], opts: &ExecOptions) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(args).env_clear().kill_on_drop(true);

        let allowed = BASE_ALLOWLIST
            .iter()
            .copied()
            .chain(self.allow_env.iter().map(String::as_str))
            .chain(opts.allow_env.iter().map(String::as_str));
        for key in allowed {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &opts.work_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

fn spawn_error(binary: &Path, err: std::io::Error) -> ZenError {
    let code = if err.kind() == std::io::ErrorKind::NotFound {
        ErrorCode::NotFound
    } else {
        ErrorCode::ExecutionFailed
    };
    ZenError::new(code, format!("cannot start {}", binary.display()))
        .with_source(err)
        .retryable(false)
}

/// Copy of `args` with secret values replaced by `***`, for logging.
///
/// Covers `--flag value` and `--flag=value` forms.
pub fn sanitize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push("***".to_string());
            redact_next = false;
            continue;
        }
        if let Some((flag, _)) = arg.split_once('=') {
            if SENSITIVE_FLAGS.contains(&flag) {
                out.push(format!("{flag}=***"));
                continue;
            }
        }
        if SENSITIVE_FLAGS.contains(&arg.as_str()) {
            redact_next = true;
        }
        out.push(arg.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    fn bin(name: &str) -> PathBuf {
        which::which(name).unwrap()
    }

    #[test]
    fn sanitize_redacts_values_after_sensitive_flags() {
        let got = sanitize_args(&args(&[
            "login", "--token", "abc123", "-p", "hunter2", "--api-key=xyz", "--verbose",
        ]));
        assert_eq!(
            got,
            args(&["login", "--token", "***", "-p", "***", "--api-key=***", "--verbose"])
        );
    }

    #[test]
    fn sanitize_leaves_plain_args_alone() {
        let a = args(&["status", "--porcelain", "key=value"]);
        assert_eq!(sanitize_args(&a), a);
    }

    #[tokio::test]
    async fn no_shell_interpolation() {
        let ctx = Context::background();
        let res = Executor::new()
            .execute(&ctx, &bin("echo"), &args(&["-c", "echo $HOME"]), &ExecOptions::default())
            .await
            .unwrap();
        assert!(res.success());
        assert_eq!(res.stdout.trim(), "-c echo $HOME");
    }

    #[tokio::test]
    async fn parent_environment_is_not_inherited() {
        std::env::set_var("ZEN_EXECUTOR_LEAK_CHECK", "leaked");
        let ctx = Context::background();
        let mut opts = ExecOptions::default();
        opts.env.insert("EXPLICIT".into(), "yes".into());
        let res = Executor::new()
            .execute(&ctx, &bin("env"), &[], &opts)
            .await
            .unwrap();
        assert!(res.stdout.contains("EXPLICIT=yes"));
        assert!(res.stdout.contains("PATH="));
        assert!(!res.stdout.contains("ZEN_EXECUTOR_LEAK_CHECK"));
    }

    #[tokio::test]
    async fn allowlisted_variables_pass_through() {
        std::env::set_var("ZEN_EXECUTOR_ALLOWED", "visible");
        let ctx = Context::background();
        let res = Executor::with_allowlist(["ZEN_EXECUTOR_ALLOWED"])
            .execute(&ctx, &bin("env"), &[], &ExecOptions::default())
            .await
            .unwrap();
        assert!(res.stdout.contains("ZEN_EXECUTOR_ALLOWED=visible"));
    }

    #[tokio::test]
    async fn non_zero_exit_is_not_an_error() {
        let ctx = Context::background();
        let res = Executor::new()
            .execute(&ctx, &bin("sh"), &args(&["-c", "echo oops >&2; exit 3"]), &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(res.exit_code, 3);
        assert!(!res.success());
        assert_eq!(res.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn work_dir_is_honoured() {
        let dir = tempfile::TempDir::new().unwrap();
        let ctx = Context::background();
        let res = Executor::new()
            .execute(&ctx, &bin("pwd"), &[], &ExecOptions::in_dir(dir.path()))
            .await
            .unwrap();
        let got = PathBuf::from(res.stdout.trim()).canonicalize().unwrap();
        assert_eq!(got, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn deadline_kills_child_with_timeout() {
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = Executor::new()
            .execute(&ctx, &bin("sleep"), &args(&["5"]), &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::Timeout));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancel_returns_canceled() {
        let ctx = Context::background();
        let c = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });
        let err = Executor::new()
            .execute(&ctx, &bin("sleep"), &args(&["5"]), &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::Canceled));
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let ctx = Context::background();
        let err = Executor::new()
            .execute(&ctx, Path::new("/definitely/not/here"), &[], &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(err.is(ErrorCode::NotFound));
    }

    #[tokio::test]
    async fn stream_interleaves_both_pipes() {
        let ctx = Context::background();
        let mut s = Executor::new()
            .stream(
                &ctx,
                &bin("sh"),
                &args(&["-c", "echo one; echo two >&2; echo three; exit 4"]),
                &ExecOptions::default(),
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        let mut err = Vec::new();
        while let Some(line) = s.next_line().await.unwrap() {
            if line.is_stderr() {
                err.push(line.text().to_string());
            } else {
                out.push(line.text().to_string());
            }
        }
        assert_eq!(out, vec!["one", "three"]);
        assert_eq!(err, vec!["two"]);
        assert_eq!(s.close().await.unwrap(), 4);
        assert_eq!(s.close().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn stream_close_without_reading() {
        let ctx = Context::background();
        let mut s = Executor::new()
            .stream(&ctx, &bin("sh"), &args(&["-c", "exit 0"]), &ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(s.close().await.unwrap(), 0);
    }
}
