use clap::Subcommand;

use zen_core::config::WarnLevel;
use zen_core::redact::redact_value;
use zen_core::ZenError;

use crate::app::App;
use crate::output::{print_structured, print_yaml, Reported};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective config (file, env and flags applied)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(app: &App, subcmd: ConfigSubcommand) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(app),
        ConfigSubcommand::Validate => validate(app),
    }
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(app: &App) -> anyhow::Result<()> {
    let mut value = serde_json::to_value(&app.config)?;
    redact_value(&mut value);
    if app.format.is_structured() {
        print_structured(app.format, &value)
    } else {
        print_yaml(&value)
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(app: &App) -> anyhow::Result<()> {
    let warnings = app.config.validate();

    if app.format.is_structured() {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_structured(app.format, &value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();
    if errors > 0 {
        let err = ZenError::config(format!("config validation found {errors} error(s)"));
        if app.format.is_structured() {
            return Err(Reported(err).into());
        }
        return Err(err.into());
    }

    Ok(())
}
