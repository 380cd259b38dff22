use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mpt_sync::{
    dump_table, load_table, run_sync, sync_source, BatchCounts, DumpOptions, ModelRegistry,
    SourceKind, SyncConfig,
};
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpt-cli")]
#[command(about = "MP Tracker public-records reconciliation")]
struct Cli {
    /// Log filter (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source listed in sources.yaml
    Sync,
    /// Reconcile the deputies listing for one legislature
    People {
        #[arg(long, default_value_t = 2012)]
        year: i32,
    },
    /// Reconcile parliamentary questions for one year
    Questions {
        #[arg(long, default_value_t = 2013)]
        year: i32,
    },
    /// Reconcile committee sitting summaries for one year
    CommitteeSummaries {
        #[arg(long, default_value_t = 2013)]
        year: i32,
    },
    /// Create any missing tables
    InitDb,
    /// Upsert JSON lines from stdin into a table, matching rows on id
    Load {
        #[arg(long)]
        table: String,
        #[arg(long)]
        update_only: bool,
    },
    /// Write a table to stdout as JSON lines
    Dump {
        #[arg(long)]
        table: String,
        /// Comma-separated column subset
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
        #[arg(long)]
        number: Option<usize>,
        /// Comma-separated `name=value`, or a bare `name` for not-null
        #[arg(long, value_delimiter = ',')]
        filter: Vec<String>,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(io::stderr))
        .init();
}

fn print_counts(label: &str, counts: BatchCounts) {
    println!(
        "{label}: created={} updated={} unchanged={}",
        counts.created, counts.updated, counts.unchanged
    );
}

fn sync_one(config: &SyncConfig, kind: SourceKind, year: i32) -> Result<()> {
    let mut store = config.open_store()?;
    let counts = sync_source(&mut store, &config.fixtures_dir, kind, year, config.flush_every)
        .with_context(|| format!("syncing {kind} for {year}"))?;
    print_counts(&format!("{kind} {year}"), counts);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = SyncConfig::from_env();
    debug!(?config, "loaded config");

    match cli.command {
        Commands::Sync => {
            let summary = run_sync(&config)?;
            for source in &summary.sources {
                print_counts(&format!("{} {}", source.source_id, source.year), source.counts);
            }
            let totals = summary.totals();
            println!(
                "sync complete: run_id={} sources={} created={} updated={} unchanged={}",
                summary.run_id,
                summary.sources.len(),
                totals.created,
                totals.updated,
                totals.unchanged
            );
        }
        Commands::People { year } => sync_one(&config, SourceKind::People, year)?,
        Commands::Questions { year } => sync_one(&config, SourceKind::Questions, year)?,
        Commands::CommitteeSummaries { year } => {
            sync_one(&config, SourceKind::CommitteeSummaries, year)?
        }
        Commands::InitDb => {
            config.open_store()?;
            let tables: Vec<_> = ModelRegistry::standard().tables().collect();
            println!(
                "database ready: {} ({})",
                config.database_path.display(),
                tables.join(", ")
            );
        }
        Commands::Load { table, update_only } => {
            let mut store = config.open_store()?;
            let counts = load_table(
                &ModelRegistry::standard(),
                &mut store,
                &table,
                io::stdin().lock(),
                update_only,
            )
            .with_context(|| format!("loading {table}"))?;
            print_counts(&table, counts);
        }
        Commands::Dump {
            table,
            columns,
            number,
            filter,
        } => {
            let mut store = config.open_store()?;
            let options = DumpOptions {
                columns,
                limit: number,
                filters: filter,
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            dump_table(&ModelRegistry::standard(), &mut store, &table, &options, &mut out)
                .with_context(|| format!("dumping {table}"))?;
            out.flush()?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_filters_and_columns_split_on_commas() {
        let cli = Cli::try_parse_from([
            "mpt-cli",
            "dump",
            "--table",
            "committee_summary",
            "--columns",
            "committee,date",
            "--filter",
            "text,committee=buget",
        ])
        .expect("parse");
        match cli.command {
            Commands::Dump {
                columns, filter, ..
            } => {
                assert_eq!(columns, vec!["committee", "date"]);
                assert_eq!(filter, vec!["text", "committee=buget"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
