//! `askesis-cli`: a thin command-line surface over `askesis_core`,
//! exercising the engine end-to-end (init, toggle, status, export,
//! import, sync, serve) without a UI, structured as a `clap::Subcommand`
//! dispatcher the way `maskdotdev-sombra`'s CLI binary does.

use askesis_core::config::{self, Config};
use askesis_core::models::{Frequency, Goal, HabitSchedule, Time};
use askesis_core::Engine;
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;

#[derive(Parser)]
#[command(name = "askesis-cli", about = "Offline-first habit tracker engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new habit scheduled daily in the morning.
    Add { name: String },
    /// Cycle a habit's status for a date (defaults to today).
    Toggle {
        habit_id: String,
        #[arg(long)]
        date: Option<String>,
        #[arg(long, default_value = "morning")]
        time: String,
    },
    /// Print today's (or a given date's) completion summary.
    Status {
        #[arg(long)]
        date: Option<String>,
    },
    /// List active habits and their current streak.
    List,
    /// Permanently delete a habit and its history.
    Delete { habit_id: String },
    /// Write a full JSON export to a file.
    Export { path: String },
    /// Replace local state with a previously exported JSON file.
    Import { path: String },
    /// Run one push/pull sync pass against the configured sync server.
    Sync,
    /// Run the reference sync server (for local testing only).
    Serve {
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_logging();
    let cli = Cli::parse();
    let cfg = Config::from_env();

    if let Command::Serve { port } = cli.command {
        let app = askesis_core::sync::server::router();
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        log::info!("askesis sync server listening on :{port}");
        axum::serve(listener, app).await?;
        return Ok(());
    }

    let engine = Engine::open(cfg)?;

    match cli.command {
        Command::Add { name } => {
            let today = askesis_core::models::today_key();
            let date = askesis_core::models::parse_date(&today).expect("today_key is always a valid date");
            let schedule = HabitSchedule {
                start_date: date,
                end_date: None,
                name: Some(name.clone()),
                name_key: None,
                icon: "\u{1F331}".to_string(),
                color: "#6366f1".to_string(),
                goal: Goal::Check,
                times: [Time::Morning].into_iter().collect::<BTreeSet<_>>(),
                frequency: Frequency::Daily,
                schedule_anchor: date,
            };
            let id = engine.actions.save_habit_from_modal(None, date, schedule)?;
            println!("created habit {id} ({name})");
        }
        Command::Toggle { habit_id, date, time } => {
            let date = date.unwrap_or_else(askesis_core::models::today_key);
            let time = parse_time(&time)?;
            engine.actions.toggle_habit_status(&habit_id, &date, time)?;
            for message in engine.actions.consume_and_format_celebrations() {
                println!("{message}");
            }
            println!("toggled {habit_id} {date} {time:?}");
        }
        Command::Status { date } => {
            let date = date.unwrap_or_else(askesis_core::models::today_key);
            let summary = engine.actions.day_summary(&date);
            println!(
                "{date}: {}/{} complete ({} snoozed, {} pending){}",
                summary.completed,
                summary.total,
                summary.snoozed,
                summary.pending,
                if summary.show_plus_indicator { " +" } else { "" }
            );
        }
        Command::List => {
            let state = engine.actions.snapshot();
            for habit in state.active_habits() {
                let name = habit.latest_name().unwrap_or("(unnamed)");
                let streak = engine
                    .actions
                    .streak(&habit.id, chrono::Utc::now().date_naive())
                    .unwrap_or(0);
                println!("{}\t{}\tstreak={}", habit.id, name, streak);
            }
        }
        Command::Delete { habit_id } => {
            engine.actions.request_habit_permanent_deletion(&habit_id).await?;
            println!("deleted {habit_id}");
        }
        Command::Export { path } => {
            let bytes = engine.actions.export_data()?;
            std::fs::write(&path, bytes)?;
            println!("exported to {path}");
        }
        Command::Import { path } => {
            let bytes = std::fs::read(&path)?;
            engine.actions.import_data(&bytes)?;
            println!("imported from {path}");
        }
        Command::Sync => {
            let report = engine.sync().await?;
            println!(
                "sync complete: pushed {:?}, pulled {:?}, conflicts resolved {:?}",
                report.shards_pushed, report.shards_pulled, report.conflicts_resolved
            );
        }
        Command::Serve { .. } => unreachable!("handled above"),
    }

    engine.actions.flush()?;
    Ok(())
}

fn parse_time(s: &str) -> anyhow::Result<Time> {
    match s.to_lowercase().as_str() {
        "morning" => Ok(Time::Morning),
        "afternoon" => Ok(Time::Afternoon),
        "evening" => Ok(Time::Evening),
        other => Err(anyhow::anyhow!("unknown time slot '{other}', expected morning/afternoon/evening")),
    }
}
