mod config;
mod driver;
mod lease;
mod llm;
mod output;
mod queue;
mod records;
mod sqlite_store;
mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pairpoll_core::{rank_answers, AnswerRow, ContestMatrix, RankingOptions};
use reqwest::Client;
use tracing::{info, warn};

use crate::config::{PairpollConfig, ResponderConfig};
use crate::driver::Orchestrator;
use crate::llm::{build_responder, TextResponder, PING_QUESTION};
use crate::queue::QuestionQueue;
use crate::records::AnswerRecord;
use crate::sqlite_store::SqliteStore;

#[derive(Parser)]
#[command(name = "pairpoll", version, about = "Poll LLM responders with forced-choice questions and rank the answers")]
struct Cli {
    /// Path to config file (default: ~/.config/pairpoll/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite status store (overrides `store` in the config file)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// More logging: -v for progress, -vv for debug. PAIRPOLL_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create a default config file at ~/.config/pairpoll/config.toml
    Init,
    /// Queue questions for every configured responder (existing progress is kept)
    Load {
        /// JSON Lines of {"question", "option_a", "option_b"}, a JSON array, or one question per line
        file: PathBuf,
    },
    /// Ask every queued question until the queues are drained
    Run {
        /// Only run these responders (repeatable)
        #[arg(long = "responder")]
        responders: Vec<String>,

        /// Retries per question on responder errors
        #[arg(long)]
        max_retries: Option<usize>,

        /// First clear leases and requeue claimed questions left by a crashed run.
        /// Only use when no other `pairpoll run` is working on this store.
        #[arg(long)]
        recover: bool,
    },
    /// Show unprocessed / claimed / answered counts per responder
    Stats,
    /// Return every claimed question to the queue
    Reset,
    /// Remove all outstanding leases
    ClearLocks,
    /// Delete every configured responder's queue
    ClearAll {
        /// Required; this discards all stored answers
        #[arg(long)]
        yes: bool,
    },
    /// Write answers_<responder>.jsonl for every responder
    Export {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Ask one responder one question directly, bypassing the queue
    Ask {
        #[arg(long)]
        responder: String,
        question: String,
    },
    /// Send a fixed test question to every configured responder
    Ping,
    /// Report answer-log rows whose answer matches neither option
    Validate {
        #[arg(required = true)]
        logs: Vec<PathBuf>,
    },
    /// Rank options from one or more answer logs
    Rank(RankArgs),
}

#[derive(clap::Args)]
struct RankArgs {
    /// Answer logs (JSON Lines with option_a, option_b, answer)
    #[arg(required = true)]
    logs: Vec<PathBuf>,

    /// Output JSON instead of tables
    #[arg(long)]
    json: bool,

    /// Fail instead of reporting when the solver does not converge
    #[arg(long)]
    strict: bool,

    /// Convergence threshold on the largest ability change between sweeps
    #[arg(long)]
    tolerance: Option<f64>,

    /// Maximum number of fixed-point sweeps
    #[arg(long)]
    max_iterations: Option<usize>,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let explicit_config = cli.config;
    let config_path = || -> Result<PathBuf> {
        match &explicit_config {
            Some(path) => Ok(path.clone()),
            None => Ok(config::config_path()?),
        }
    };
    let store = cli.store;
    let app = || App::open(config_path()?, store.clone());

    match cli.command {
        Commands::Init => {
            let config_path = config_path()?;
            config::create_default_config(&config_path)?;
            println!("Created config at {}", config_path.display());
            println!("Add a [[responders]] block per model, then `pairpoll load <questions>`.");
        }
        Commands::Load { file } => app()?.load(&file)?,
        Commands::Run { responders, max_retries, recover } => app()?.run(&responders, max_retries, recover).await?,
        Commands::Stats => app()?.stats()?,
        Commands::Reset => app()?.reset()?,
        Commands::ClearLocks => {
            let cleared = app()?.queue.clear_locks()?;
            println!("Removed {cleared} leases");
        }
        Commands::ClearAll { yes } => {
            if !yes {
                bail!("clear-all deletes every stored answer; pass --yes to confirm");
            }
            app()?.clear_all()?;
        }
        Commands::Export { out_dir } => app()?.export(&out_dir)?,
        Commands::Ask { responder, question } => app()?.ask(&responder, &question).await?,
        Commands::Ping => app()?.ping().await?,
        Commands::Validate { logs } => run_validate(&logs)?,
        Commands::Rank(args) => run_rank(&args)?,
    }
    Ok(())
}

fn init_tracing(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("PAIRPOLL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

/// Config plus an open store: everything the queue-backed commands need.
struct App {
    cfg: PairpollConfig,
    config_path: PathBuf,
    store_path: PathBuf,
    queue: Arc<QuestionQueue>,
}

impl App {
    fn open(config_path: PathBuf, store_override: Option<PathBuf>) -> Result<Self> {
        let cfg = config::load_config(&config_path)?;
        let store_path = store_override.unwrap_or_else(|| cfg.store_path());
        Self::with_config(cfg, config_path, store_path)
    }

    fn with_config(cfg: PairpollConfig, config_path: PathBuf, store_path: PathBuf) -> Result<Self> {
        let store = SqliteStore::open(&store_path)
            .with_context(|| format!("failed to open store {}", store_path.display()))?;
        let queue = Arc::new(QuestionQueue::new(Arc::new(store), cfg.lease_timeout()));
        Ok(App { cfg, config_path, store_path, queue })
    }

    fn responders(&self) -> Result<&[ResponderConfig]> {
        if self.cfg.responders.is_empty() {
            bail!(
                "No responders configured. Add [[responders]] to {} (see `pairpoll init`).",
                self.config_path.display()
            );
        }
        Ok(&self.cfg.responders)
    }

    fn responder(&self, name: &str) -> Result<&ResponderConfig> {
        self.cfg
            .find_responder(name)
            .with_context(|| format!("No responder named {name:?} in {}", self.config_path.display()))
    }

    fn load(&self, file: &Path) -> Result<()> {
        let questions = records::load_questions(file)?;
        if questions.is_empty() {
            bail!("No questions found in {}", file.display());
        }
        for responder in self.responders()? {
            let summary = self.queue.load(responder.name(), &questions)?;
            println!("{}: {} new, {} already queued", responder.name(), summary.inserted, summary.existing);
        }
        Ok(())
    }

    async fn run(&self, only: &[String], max_retries: Option<usize>, recover: bool) -> Result<()> {
        let mut selected = Vec::new();
        if only.is_empty() {
            selected.extend(self.responders()?);
        } else {
            for name in only {
                selected.push(self.responder(name)?);
            }
        }

        let client = Client::new();
        let responders = selected
            .iter()
            .map(|rc| build_responder(rc, client.clone()))
            .collect::<Result<Vec<Arc<dyn TextResponder>>, _>>()?;

        let orchestrator = Orchestrator::new(self.queue.clone(), max_retries.unwrap_or_else(|| self.cfg.max_retries()));
        if recover {
            let names: Vec<String> = responders.iter().map(|r| r.name().to_string()).collect();
            let count = names.len();
            let recovered = orchestrator.recover(names).await?;
            info!(recovered, responders = count, "recovery done");
        }

        let cancel = orchestrator.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; stopping responders");
                cancel.cancel();
            }
        });

        let mut summaries = Vec::new();
        let mut failures = 0;
        for result in orchestrator.run(responders).await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    failures += 1;
                }
            }
        }
        output::print_run_summary(&summaries);

        if failures > 0 {
            bail!("{failures} responder(s) stopped with an error");
        }
        Ok(())
    }

    fn stats(&self) -> Result<()> {
        let mut stats = Vec::new();
        for name in self.cfg.responder_names() {
            let s = self.queue.stats(&name)?;
            stats.push((name, s));
        }
        output::print_stats(&stats);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        for name in self.responders()?.iter().map(ResponderConfig::name) {
            let reset = self.queue.reset_claimed(name)?;
            println!("{name}: {reset} claimed questions returned to the queue");
        }
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        for name in self.cfg.responder_names() {
            self.queue.clear(&name)?;
        }
        self.queue.clear_locks()?;
        println!("Cleared {} responder queues in {}", self.cfg.responders.len(), self.store_path.display());
        Ok(())
    }

    async fn ask(&self, responder: &str, question: &str) -> Result<()> {
        let responder = build_responder(self.responder(responder)?, Client::new())?;
        println!("{}", responder.answer(question).await?);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let client = Client::new();
        for rc in self.responders()? {
            let reply = match build_responder(rc, client.clone()) {
                Ok(responder) => responder.answer(PING_QUESTION).await.map_err(anyhow::Error::from),
                Err(e) => Err(e.into()),
            };
            match reply {
                Ok(text) => println!("{}\t{}\t{}", rc.name(), rc.base_url(), text.trim()),
                Err(e) => println!("{}\t{}\tERROR: {e:#}", rc.name(), rc.base_url()),
            }
        }
        Ok(())
    }

    fn export(&self, out_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;

        for name in self.responders()?.iter().map(ResponderConfig::name) {
            let answered = self.queue.answered(name)?;
            let total = answered.len();
            let rows: Vec<AnswerRecord> = answered.into_iter().filter_map(Option::<AnswerRecord>::from).collect();
            if rows.len() < total {
                warn!(responder = name, skipped = total - rows.len(), "answers without option metadata were not exported");
            }

            let path = out_dir.join(format!("answers_{}.jsonl", records::safe_filename(name)));
            records::write_answer_log(&path, &rows)?;
            println!("{name}: {} answers -> {}", rows.len(), path.display());
        }
        Ok(())
    }
}

fn read_rows(path: &Path) -> Result<Vec<AnswerRow>> {
    Ok(records::read_answer_log(path)?.iter().map(AnswerRow::from).collect())
}

fn run_validate(logs: &[PathBuf]) -> Result<()> {
    for path in logs {
        let rows = read_rows(path)?;
        let warnings = ContestMatrix::from_log(&rows).warnings;
        for warning in &warnings {
            println!("{}: {}", path.display(), output::describe_warning(warning));
        }
        println!("{}: {} rows, {} invalid", path.display(), rows.len(), warnings.len());
    }
    Ok(())
}

fn run_rank(args: &RankArgs) -> Result<()> {
    let defaults = RankingOptions::default();
    let options = RankingOptions {
        tolerance: args.tolerance.unwrap_or(defaults.tolerance),
        max_iterations: args.max_iterations.unwrap_or(defaults.max_iterations),
        ..defaults
    };
    if options.tolerance.is_nan() || options.tolerance <= 0.0 {
        bail!("--tolerance must be positive");
    }
    if options.max_iterations == 0 {
        bail!("--max-iterations must be at least 1");
    }

    let mut reports = Vec::with_capacity(args.logs.len());
    for path in &args.logs {
        let rows = read_rows(path)?;
        let report = rank_answers(&rows, &options).with_context(|| format!("cannot rank {}", path.display()))?;
        if args.strict {
            report
                .ensure_converged()
                .with_context(|| format!("cannot rank {}", path.display()))?;
        }
        reports.push((records::log_label(path), report));
    }

    if args.json {
        output::print_json(&reports)?;
    } else {
        output::print_tables(&reports);
        if reports.len() > 1 {
            println!();
            print!("{}", output::render_cross_table(&reports));
        }
    }
    Ok(())
}
