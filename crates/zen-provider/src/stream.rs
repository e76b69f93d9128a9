use std::collections::VecDeque;

use futures::Stream;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::debug;

use zen_core::{Context, Result, ZenError};

/// One line of output, tagged with the pipe it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }

    pub fn is_stderr(&self) -> bool {
        matches!(self, OutputLine::Stderr(_))
    }
}

// ─── OutputStream ─────────────────────────────────────────────────────────

/// Line reader over a running command, or over an already-buffered
/// response for API providers.
///
/// A process-backed stream owns exactly one child. Lines from stdout and
/// stderr are interleaved in arrival order. Dropping the stream kills the
/// child; [`OutputStream::close`] waits for it and is safe to call twice.
pub struct OutputStream {
    source: Source,
    ctx: Context,
    exit_code: Option<i32>,
}

enum Source {
    Process {
        child: Child,
        stdout: Option<Lines<BufReader<ChildStdout>>>,
        stderr: Option<Lines<BufReader<ChildStderr>>>,
    },
    Buffered(VecDeque<OutputLine>),
}

enum Next {
    Out(std::io::Result<Option<String>>),
    Err(std::io::Result<Option<String>>),
    Done,
}

impl OutputStream {
    /// Wrap a spawned child whose stdout and stderr are piped.
    pub(crate) fn from_child(mut child: Child, ctx: Context) -> Result<Self> {
        let stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        if stdout.is_none() && stderr.is_none() {
            return Err(ZenError::new(
                zen_core::ErrorCode::ExecutionFailed,
                "child output not captured",
            ));
        }
        Ok(Self {
            source: Source::Process {
                child,
                stdout,
                stderr,
            },
            ctx,
            exit_code: None,
        })
    }

    /// A finished stream over `text` (stdout) with the given exit code.
    pub fn from_text(text: &str, exit_code: i32) -> Self {
        let lines = text
            .lines()
            .map(|l| OutputLine::Stdout(l.to_string()))
            .collect();
        Self {
            source: Source::Buffered(lines),
            ctx: Context::background(),
            exit_code: Some(exit_code),
        }
    }

    /// Next line from either pipe, `None` once both are exhausted.
    pub async fn next_line(&mut self) -> Result<Option<OutputLine>> {
        let (child, stdout, stderr) = match &mut self.source {
            Source::Buffered(lines) => return Ok(lines.pop_front()),
            Source::Process {
                child,
                stdout,
                stderr,
            } => (child, stdout, stderr),
        };

        loop {
            if stdout.is_none() && stderr.is_none() {
                return Ok(None);
            }
            let has_out = stdout.is_some();
            let has_err = stderr.is_some();
            let next = tokio::select! {
                biased;
                _ = self.ctx.done() => Next::Done,
                r = read_opt(stdout), if has_out => Next::Out(r),
                r = read_opt(stderr), if has_err => Next::Err(r),
            };
            match next {
                Next::Done => {
                    let _ = child.kill().await;
                    return Err(self
                        .ctx
                        .err()
                        .unwrap_or_else(|| ZenError::canceled("stream canceled")));
                }
                Next::Out(Ok(Some(line))) => return Ok(Some(OutputLine::Stdout(line))),
                Next::Err(Ok(Some(line))) => return Ok(Some(OutputLine::Stderr(line))),
                Next::Out(Ok(None)) => *stdout = None,
                Next::Err(Ok(None)) => *stderr = None,
                Next::Out(Err(e)) | Next::Err(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Adapt into a [`Stream`] of lines. The stream ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<OutputLine>> {
        futures::stream::unfold(Some(self), |state| async move {
            let mut s = state?;
            match s.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(s))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Drain the stream into one string, one line per output line.
    pub async fn read_to_string(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(line) = self.next_line().await? {
            out.push_str(line.text());
            out.push('\n');
        }
        Ok(out)
    }

    /// Wait for the child and return its exit code. Unread output is
    /// discarded. Calling again returns the same code.
    pub async fn close(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let Source::Process {
            child,
            stdout,
            stderr,
        } = &mut self.source
        else {
            return Ok(0);
        };
        *stdout = None;
        *stderr = None;

        let status = tokio::select! {
            s = child.wait() => Some(s),
            _ = self.ctx.done() => None,
        };
        let code = match status {
            Some(Ok(s)) => s.code().unwrap_or(-1),
            Some(Err(e)) => {
                debug!(error = %e, "wait on streamed child failed");
                -1
            }
            None => {
                let _ = child.kill().await;
                -1
            }
        };
        self.exit_code = Some(code);
        Ok(code)
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Process { .. } => "process",
            Source::Buffered(_) => "buffered",
        };
        f.debug_struct("OutputStream")
            .field("source", &kind)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

async fn read_opt<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines.as_mut() {
        Some(l) => l.next_line().await,
        None => Ok(None),
    }
}
