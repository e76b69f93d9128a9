use clap::Subcommand;

use zen_core::types::ConflictStatus;

use crate::app::App;
use crate::output::{print_structured, print_table};

#[derive(Subcommand)]
pub enum ConflictsSubcommand {
    /// List conflicts parked for manual review
    List {
        /// Include resolved and ignored conflicts
        #[arg(long)]
        all: bool,
    },

    /// Close a pending conflict so the task syncs again
    Resolve {
        task_id: String,
        /// Mark the conflict ignored instead of resolved
        #[arg(long)]
        ignore: bool,
        /// Who resolved it (defaults to $USER)
        #[arg(long)]
        by: Option<String>,
    },
}

pub fn run(app: &App, subcmd: ConflictsSubcommand) -> anyhow::Result<()> {
    match subcmd {
        ConflictsSubcommand::List { all } => list(app, all),
        ConflictsSubcommand::Resolve { task_id, ignore, by } => {
            let by = by
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "unknown".to_string());
            resolve(app, &task_id, ignore, &by)
        }
    }
}

fn list(app: &App, all: bool) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let conflicts: Vec<_> = engine
        .list_conflicts()
        .into_iter()
        .filter(|c| all || c.status == ConflictStatus::Pending)
        .collect();

    if app.format.is_structured() {
        return print_structured(app.format, &conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    let rows = conflicts
        .iter()
        .flat_map(|c| {
            c.conflicts.iter().map(move |f| {
                vec![
                    c.task_id.clone(),
                    c.status.to_string(),
                    f.field.clone(),
                    f.local_value.clone(),
                    f.external_value.clone(),
                    c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ]
            })
        })
        .collect();
    print_table(
        &["TASK", "STATUS", "FIELD", "LOCAL", "EXTERNAL", "SINCE"],
        rows,
    );
    Ok(())
}

fn resolve(app: &App, task_id: &str, ignore: bool, by: &str) -> anyhow::Result<()> {
    let engine = app.open_engine()?;
    let status = if ignore {
        ConflictStatus::Ignored
    } else {
        ConflictStatus::Resolved
    };
    let record = engine.resolve_conflict(task_id, by, status)?;

    if app.format.is_structured() {
        return print_structured(app.format, &record);
    }
    println!("conflict for {task_id} {status} by {by}");
    Ok(())
}
