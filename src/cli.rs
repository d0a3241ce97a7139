use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::records::RecordsOptions;
use crate::commands::{self, CommandReport, Runtime};
use crate::logging;
use crate::snap::config::load_config;
use crate::snap::paths::LookoutPaths;

#[derive(Debug, Parser)]
#[command(name = "lookout", version, about = "Camera snapshot annotation daemon")]
pub struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    pub json: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the intake worker and scheduled jobs until stopped.
    Run,
    /// Process one snapshot file now.
    Process { path: PathBuf },
    /// Enqueue snapshots newer than the progress marker and process them.
    Scan,
    /// Capture a frame from the configured camera.
    Capture {
        #[arg(long)]
        preview: bool,
    },
    CompareRecent,
    CompareHourly,
    /// Compare two snapshot files.
    Compare { a: PathBuf, b: PathBuf },
    DailyReport,
    /// Answer a question from recent snapshot descriptions.
    Ask {
        query: String,
        #[arg(long)]
        lookback_hours: Option<u64>,
        #[arg(long)]
        max_items: Option<usize>,
    },
    /// Evict snapshots, artifacts and records older than the retention window.
    Cleanup {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        archive: bool,
    },
    /// Print records of one list.
    Records {
        list: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long)]
        newest_first: bool,
        #[arg(long)]
        since_hours: Option<u64>,
    },
    /// Token and cost totals.
    Usage {
        #[arg(long, default_value_t = 7)]
        days: u64,
    },
    Status,
}

impl Command {
    fn dispatch(self, rt: &Runtime) -> Result<CommandReport> {
        match self {
            Self::Run => commands::run::run(rt),
            Self::Process { path } => commands::process::run(rt, &path),
            Self::Scan => commands::scan::run(rt),
            Self::Capture { preview } => commands::capture::run(rt, preview),
            Self::CompareRecent => commands::compare::run_recent(rt),
            Self::CompareHourly => commands::compare::run_hourly(rt),
            Self::Compare { a, b } => commands::compare::run_custom(rt, &a, &b),
            Self::DailyReport => commands::report::run(rt),
            Self::Ask {
                query,
                lookback_hours,
                max_items,
            } => commands::ask::run(rt, &query, lookback_hours, max_items),
            Self::Cleanup { dry_run, archive } => commands::cleanup::run(rt, dry_run, archive),
            Self::Records {
                list,
                limit,
                offset,
                newest_first,
                since_hours,
            } => commands::records::run(
                rt,
                &RecordsOptions {
                    list,
                    limit,
                    offset,
                    newest_first,
                    since_hours,
                },
            ),
            Self::Usage { days } => commands::usage::run(rt, days),
            Self::Status => commands::status::run(rt),
        }
    }
}

fn render_text(report: &CommandReport) -> String {
    let mut out = format!(
        "{}: {}\n",
        report.command,
        if report.ok { "ok" } else { "failed" }
    );
    for detail in &report.details {
        out.push_str(&format!("  {detail}\n"));
    }
    for issue in &report.issues {
        out.push_str(&format!("  issue: {issue}\n"));
    }
    out
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config()?;
    logging::init(&cfg.log_level, Some(&LookoutPaths::new(&cfg.data_dir).log_file()));

    let rt = Runtime::open(cfg)?;
    let report = cli.command.dispatch(&rt)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_text(&report));
    }
    if !report.ok {
        anyhow::bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn records_flags_parse() {
        let cli = Cli::try_parse_from([
            "lookout",
            "records",
            "compare-hourly",
            "--limit",
            "5",
            "--newest-first",
            "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        match cli.command {
            Command::Records {
                list,
                limit,
                offset,
                newest_first,
                since_hours,
            } => {
                assert_eq!(list, "compare-hourly");
                assert_eq!(limit, Some(5));
                assert_eq!(offset, 0);
                assert!(newest_first);
                assert_eq!(since_hours, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ask_takes_a_question_and_optional_window() {
        let cli = Cli::try_parse_from([
            "lookout",
            "ask",
            "was there a car?",
            "--lookback-hours",
            "6",
        ])
        .expect("parse");
        match cli.command {
            Command::Ask {
                query,
                lookback_hours,
                max_items,
            } => {
                assert_eq!(query, "was there a car?");
                assert_eq!(lookback_hours, Some(6));
                assert_eq!(max_items, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn text_report_lists_details_then_issues() {
        let mut report = CommandReport::new("cleanup");
        report.detail("removed=1");
        report.issue("disk");
        assert_eq!(render_text(&report), "cleanup: failed\n  removed=1\n  issue: disk\n");
    }
}
