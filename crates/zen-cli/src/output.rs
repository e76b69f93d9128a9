use std::io::IsTerminal;

use clap::ValueEnum;
use serde::Serialize;
use zen_core::{ErrorCode, ZenError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    /// Parse a configured value; unknown values fall back to text.
    pub fn from_config(s: &str) -> Self {
        match s {
            "json" => OutputFormat::Json,
            "yaml" => OutputFormat::Yaml,
            _ => OutputFormat::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
        }
    }

    pub fn is_structured(self) -> bool {
        self != OutputFormat::Text
    }
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_yaml<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(value)?;
    print!("{}", yaml);
    Ok(())
}

/// Print `value` as JSON or YAML. Text mode is handled by the caller.
pub fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<()> {
    match format {
        OutputFormat::Yaml => print_yaml(value),
        _ => print_json(value),
    }
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub retryable: bool,
}

/// A failure whose details were already printed; only its exit code remains.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Reported(#[source] pub ZenError);

/// The first [`ZenError`] in the chain, if any.
pub fn zen_error(err: &anyhow::Error) -> Option<&ZenError> {
    err.chain().find_map(|e| e.downcast_ref::<ZenError>())
}

pub const EXIT_UNEXPECTED: i32 = 1;
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_PROVIDER: i32 = 4;
pub const EXIT_CONFLICT: i32 = 5;

pub fn exit_code(err: &anyhow::Error) -> i32 {
    match zen_error(err).map(|z| z.code) {
        Some(ErrorCode::ConfigError) => EXIT_CONFIG,
        Some(ErrorCode::SyncConflict) => EXIT_CONFLICT,
        Some(
            ErrorCode::ProviderError
            | ErrorCode::AuthFailed
            | ErrorCode::NetworkError
            | ErrorCode::Timeout
            | ErrorCode::RateLimited,
        ) => EXIT_PROVIDER,
        _ => EXIT_UNEXPECTED,
    }
}

/// The error chain as `context: message: cause`, with [`ZenError`]s shown by
/// message only.
pub fn render(err: &anyhow::Error) -> String {
    let mut parts = Vec::new();
    for e in err.chain() {
        if let Some(z) = e.downcast_ref::<ZenError>() {
            parts.push(z.message.clone());
        } else if e.downcast_ref::<Reported>().is_none() {
            parts.push(e.to_string());
        }
    }
    parts.join(": ")
}

pub fn error_report(err: &anyhow::Error) -> ErrorReport {
    match zen_error(err) {
        Some(z) => ErrorReport {
            code: z.code.to_string(),
            message: z.message.clone(),
            provider: z.provider.clone(),
            task_id: z.task_id.clone(),
            retryable: z.retryable,
        },
        None => ErrorReport {
            code: "unexpected".to_string(),
            message: render(err),
            provider: None,
            task_id: None,
            retryable: false,
        },
    }
}

/// Report `err` on stdout (structured modes) or stderr (text).
pub fn print_error(format: OutputFormat, color: bool, err: &anyhow::Error) {
    if err.downcast_ref::<Reported>().is_some() {
        return;
    }
    if format.is_structured() {
        if print_structured(format, &error_report(err)).is_ok() {
            return;
        }
    }
    let prefix = if color && std::io::stderr().is_terminal() {
        "\x1b[31mError:\x1b[0m"
    } else {
        "Error:"
    };
    eprintln!("{prefix} {}", render(err));
    if let Some(hint) = zen_error(err).and_then(|z| z.hint.as_deref()) {
        eprintln!("hint: {hint}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_code_classes() {
        let class = |code| exit_code(&anyhow::Error::new(ZenError::new(code, "x")));
        assert_eq!(class(ErrorCode::ConfigError), 3);
        assert_eq!(class(ErrorCode::AuthFailed), 4);
        assert_eq!(class(ErrorCode::RateLimited), 4);
        assert_eq!(class(ErrorCode::SyncConflict), 5);
        assert_eq!(class(ErrorCode::NotFound), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn reported_errors_keep_their_class() {
        let err = anyhow::Error::new(Reported(ZenError::new(ErrorCode::SyncConflict, "x")));
        assert_eq!(exit_code(&err), 5);
        assert_eq!(error_report(&err).code, "sync_conflict");
    }

    #[test]
    fn report_finds_zen_error_under_context() {
        let res: anyhow::Result<()> = Err(ZenError::new(ErrorCode::SyncConflict, "needs review")
            .with_task("T1"))
        .context("sync failed");
        let err = res.unwrap_err();
        let report = error_report(&err);
        assert_eq!(report.code, "sync_conflict");
        assert_eq!(report.message, "needs review");
        assert_eq!(report.task_id.as_deref(), Some("T1"));
        assert!(!report.retryable);
    }

    #[test]
    fn render_strips_error_prefix() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let res: anyhow::Result<()> = Err(ZenError::config("cannot read config.yaml")
            .with_source(io))
        .context("startup");
        assert_eq!(
            render(&res.unwrap_err()),
            "startup: cannot read config.yaml: gone"
        );
    }

    #[test]
    fn report_for_foreign_errors() {
        let err = anyhow::anyhow!("boom");
        let report = error_report(&err);
        assert_eq!(report.code, "unexpected");
        assert_eq!(report.message, "boom");
    }

    #[test]
    fn config_formats() {
        assert_eq!(OutputFormat::from_config("yaml"), OutputFormat::Yaml);
        assert_eq!(OutputFormat::from_config("bogus"), OutputFormat::Text);
        assert!(OutputFormat::Json.is_structured());
    }
}
