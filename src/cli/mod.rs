//! Command-line interface.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Parser)]
#[command(name = "newsacq")]
#[command(about = "News article acquisition and analysis system")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ./newsacquire.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawl daemon (scheduler + daily archive) until interrupted
    Daemon,

    /// Manage news sources and their crawlers
    Sources {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Run a single crawler tick by name
    Crawl {
        /// Crawler name (e.g. "ettoday_list")
        name: String,
    },

    /// Inspect and manage the URL queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Archive raw HTML into batch files
    Archive {
        #[command(subcommand)]
        command: ArchiveCommands,
    },

    /// Restore archived raw HTML back into the database
    Restore {
        /// Article ids to restore
        article_ids: Vec<i64>,
    },

    /// Replay parsers over stored and archived HTML
    Reparse {
        #[command(subcommand)]
        command: ReparseCommands,
    },

    /// Run and manage analysis pipeline runs
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },

    /// Manage LLM analysis tracking and retries
    Analysis {
        #[command(subcommand)]
        command: AnalysisCommands,
    },

    /// Manage force-included articles
    ForceInclude {
        #[command(subcommand)]
        command: ForceIncludeCommands,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// List registered crawlers and their status
    List,
    /// Per-source article statistics
    Stats,
    /// Re-sync the crawler registry into the database
    Sync,
    /// Activate a crawler
    Enable { name: String },
    /// Deactivate a crawler (it keeps its statistics)
    Disable { name: String },
    /// Change a crawler's scheduling interval
    SetInterval { name: String, minutes: i64 },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Queue counts by status
    Stats {
        /// Restrict to one source
        #[arg(long)]
        source: Option<String>,
    },
    /// Force-reset PROCESSING URLs back to PENDING
    Reset {
        /// Restrict to one source (default: all)
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Subcommand)]
enum ArchiveCommands {
    /// Archive one source
    Run {
        source: String,
        /// Archive articles crawled on this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
        /// Archive articles crawled before this date (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,
    },
    /// Archive every source
    All {
        /// Archive articles crawled before this date (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,
    },
    /// Show archive layout for a source
    Info { source: String },
}

#[derive(Subcommand)]
enum ReparseCommands {
    /// Start a background reparse job for a source
    Start { source: String },
    /// Show a job's progress
    Status { job_id: String },
    /// Request cancellation of a running job
    Cancel { job_id: String },
    /// List recent jobs
    Jobs,
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// Create and run a pipeline over recent articles
    Run {
        /// Days to look back (default from configuration)
        #[arg(long)]
        days: Option<i64>,
        /// Window start (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Window end (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        /// Stop after this stage (fetch, rule_filter, llm_analysis, store)
        #[arg(long)]
        until_stage: Option<String>,
        /// Maximum articles to process
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Resume an existing run (re-executes stages; persisted batch ids
    /// are polled, not resubmitted)
    Resume {
        run_id: i64,
        /// Stop after this stage
        #[arg(long)]
        until_stage: Option<String>,
        /// Maximum articles to process
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Reset a run's artifacts from a stage onward
    Reset {
        run_id: i64,
        /// Stage to reset from (rule_filter, llm_analysis, store)
        #[arg(long, default_value = "rule_filter")]
        from_stage: String,
    },
    /// List recent runs
    List,
    /// Detailed statistics for a run
    Stats { run_id: i64 },
}

#[derive(Subcommand)]
enum AnalysisCommands {
    /// Re-submit FAILED articles as a new batch
    RetryFailed,
    /// Retry storage for STORE_FAILED articles (no LLM calls)
    RetryStoreFailed,
    /// Tracking counts by status
    Stats,
    /// Delete tracking rows
    Clear {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        failed: bool,
        /// Clear rows for one article
        #[arg(long)]
        article_id: Option<i64>,
        /// Clear rows for one batch
        #[arg(long)]
        batch_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum ForceIncludeCommands {
    /// Force an article past all filter rules
    Add {
        article_id: i64,
        reason: String,
        #[arg(long)]
        added_by: Option<String>,
    },
    /// Remove a force-include entry
    Remove { article_id: i64 },
    /// List force-included articles
    List,
}

/// Parse arguments and dispatch.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = crate::config::Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Daemon => commands::daemon(settings).await,
        Commands::Sources { command } => match command {
            SourceCommands::List => commands::sources_list(settings),
            SourceCommands::Stats => commands::sources_stats(settings),
            SourceCommands::Sync => commands::sources_sync(settings),
            SourceCommands::Enable { name } => commands::crawler_set_active(settings, &name, true),
            SourceCommands::Disable { name } => {
                commands::crawler_set_active(settings, &name, false)
            }
            SourceCommands::SetInterval { name, minutes } => {
                commands::crawler_set_interval(settings, &name, minutes)
            }
        },
        Commands::Crawl { name } => commands::crawl_once(settings, &name).await,
        Commands::Queue { command } => match command {
            QueueCommands::Stats { source } => commands::queue_stats(settings, source.as_deref()),
            QueueCommands::Reset { source } => commands::queue_reset(settings, source.as_deref()),
        },
        Commands::Archive { command } => match command {
            ArchiveCommands::Run {
                source,
                date,
                before,
            } => commands::archive_run(settings, &source, date.as_deref(), before.as_deref()),
            ArchiveCommands::All { before } => commands::archive_all(settings, before.as_deref()),
            ArchiveCommands::Info { source } => commands::archive_info(settings, &source),
        },
        Commands::Restore { article_ids } => commands::restore(settings, &article_ids),
        Commands::Reparse { command } => match command {
            ReparseCommands::Start { source } => commands::reparse_start(settings, &source).await,
            ReparseCommands::Status { job_id } => commands::reparse_status(settings, &job_id),
            ReparseCommands::Cancel { job_id } => commands::reparse_cancel(settings, &job_id).await,
            ReparseCommands::Jobs => commands::reparse_jobs(settings),
        },
        Commands::Pipeline { command } => match command {
            PipelineCommands::Run {
                days,
                from,
                to,
                until_stage,
                limit,
            } => {
                commands::pipeline_run(
                    settings,
                    days,
                    from.as_deref(),
                    to.as_deref(),
                    until_stage.as_deref(),
                    limit,
                )
                .await
            }
            PipelineCommands::Resume {
                run_id,
                until_stage,
                limit,
            } => commands::pipeline_resume(settings, run_id, until_stage.as_deref(), limit).await,
            PipelineCommands::Reset { run_id, from_stage } => {
                commands::pipeline_reset(settings, run_id, &from_stage)
            }
            PipelineCommands::List => commands::pipeline_list(settings),
            PipelineCommands::Stats { run_id } => commands::pipeline_stats(settings, run_id),
        },
        Commands::Analysis { command } => match command {
            AnalysisCommands::RetryFailed => commands::analysis_retry_failed(settings).await,
            AnalysisCommands::RetryStoreFailed => commands::analysis_retry_store_failed(settings),
            AnalysisCommands::Stats => commands::analysis_stats(settings),
            AnalysisCommands::Clear {
                all,
                failed,
                article_id,
                batch_id,
            } => commands::analysis_clear(settings, all, failed, article_id, batch_id.as_deref()),
        },
        Commands::ForceInclude { command } => match command {
            ForceIncludeCommands::Add {
                article_id,
                reason,
                added_by,
            } => commands::force_include_add(settings, article_id, &reason, added_by.as_deref()),
            ForceIncludeCommands::Remove { article_id } => {
                commands::force_include_remove(settings, article_id)
            }
            ForceIncludeCommands::List => commands::force_include_list(settings),
        },
    }
}
