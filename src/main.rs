use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lead_intake::{
    commands::{
        export_snapshot, ingest, insights, lead, migrate, normalize, run, score, top_leads,
    },
    context::AppContext,
    models::{LeadSegment, Provider},
    sources::ExportFormat,
};
use log::info;
use std::env;
use std::path::PathBuf;

const DEFAULT_SNAPSHOT_FILE: &str = "data/normalized-events.bin";

#[derive(Parser)]
#[command(name = "lead-intake")]
#[command(about = "Analytics data intake and lead scoring pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the intake tables
    Migrate,
    /// Load an analytics export file into the raw event layer
    Ingest {
        /// Path to the export file
        input: PathBuf,
        /// Analytics provider the export came from (metrika or ga4)
        #[arg(long)]
        provider: Provider,
        /// Export format (inferred from the file extension when omitted)
        #[arg(long, value_enum)]
        format: Option<ExportFormat>,
        /// Normalize pending raw events right after ingesting
        #[arg(long)]
        normalize: bool,
    },
    /// Normalize all pending raw events
    Normalize,
    /// Recompute lead features and hot scores
    Score {
        /// Score a normalized event snapshot instead of the database
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Number of top leads to print
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run the full intake pipeline (ingest, normalize, score, insights)
    Run {
        /// Export files to ingest on each run
        #[arg(num_args = 0..)]
        inputs: Vec<PathBuf>,
        /// Analytics provider of the input files
        #[arg(long, default_value = "metrika")]
        provider: Provider,
        /// Export format (inferred from the file extension when omitted)
        #[arg(long, value_enum)]
        format: Option<ExportFormat>,
        /// Repeat the run every N seconds until interrupted
        #[arg(long = "interval-secs")]
        interval_secs: Option<u64>,
    },
    /// Summarize lead quality per traffic source
    Insights,
    /// Print the highest scored leads
    TopLeads {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only show leads in this segment (hot, warm or cold)
        #[arg(long)]
        segment: Option<LeadSegment>,
    },
    /// Print stored features for one lead
    Lead {
        /// Analytics client id of the lead
        client_id: String,
    },
    /// Export normalized events for offline scoring
    ExportSnapshot {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Days of history to include (defaults to FEATURE_LOOKBACK_DAYS)
        #[arg(long)]
        lookback_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline scoring, use score --data-file."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting lead intake");

    match command {
        Commands::Migrate => {
            migrate::run(&app_context).await?;
        }
        Commands::Ingest {
            input,
            provider,
            format,
            normalize,
        } => {
            ingest::run(&app_context, &input, provider, format, normalize).await?;
        }
        Commands::Normalize => {
            normalize::run(&app_context).await?;
        }
        Commands::Score { data_file, limit } => {
            score::run(&app_context, data_file.as_deref(), limit).await?;
        }
        Commands::Run {
            inputs,
            provider,
            format,
            interval_secs,
        } => {
            run::run(&app_context, &inputs, provider, format, interval_secs).await?;
        }
        Commands::Insights => {
            insights::run(&app_context).await?;
        }
        Commands::TopLeads { limit, segment } => {
            top_leads::run(&app_context, limit, segment).await?;
        }
        Commands::Lead { client_id } => {
            lead::run(&app_context, &client_id).await?;
        }
        Commands::ExportSnapshot {
            output,
            lookback_days,
        } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_FILE));
            export_snapshot::run(&app_context, &output_path, lookback_days).await?;
        }
    }

    Ok(())
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Score { data_file, .. } => data_file.is_none(),
        Commands::Migrate
        | Commands::Ingest { .. }
        | Commands::Normalize
        | Commands::Run { .. }
        | Commands::Insights
        | Commands::TopLeads { .. }
        | Commands::Lead { .. }
        | Commands::ExportSnapshot { .. } => true,
    }
}
