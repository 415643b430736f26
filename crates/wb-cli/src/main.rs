mod config;
mod replay;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{tabs_scope, CliConfig};
use replay::{read_events, ReplayRunService};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wb_core::{translate, RunMode, RunService, RunStatus, ScopedStorage, ScopedStorageExt};
use wb_session::{FileTab, RunOutcome, RunRequest, SaveOutcome, TabSetSnapshot, TabStatus, Workbench};
use wb_storage::{LocalFileService, SqliteScopedStore};

#[derive(Parser)]
#[command(name = "wb")]
#[command(about = "Config package workbench session tools", long_about = None)]
struct Cli {
    /// TOML config file (defaults to the per-user wb/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the package files
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Directory for persisted session state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Package id used to scope persisted tabs and to label runs
    #[arg(long, global = true, default_value = "default")]
    package: String,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Translate an NDJSON run event log into console lines
    Events {
        /// Event log path, or "-" for stdin
        input: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Replay a recorded run through the session controller
    Run {
        events: PathBuf,
        #[arg(long)]
        mode: Option<RunMode>,
        /// Directory with outputs.json, summary.json, and telemetry.json
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        dry_run: bool,
        /// Print the final session snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// List files under the package root
    Files,
    /// Show the persisted tab set
    Tabs,
    /// Open files into the persisted tab set and load them
    Open { ids: Vec<String> },
    /// Close tabs
    Close { ids: Vec<String> },
    /// Replace a file's content and save it with its current version token
    Save {
        id: String,
        /// File whose content becomes the new content
        #[arg(long)]
        from: PathBuf,
        /// Create the file when it does not exist yet
        #[arg(long)]
        create: bool,
    },
}

struct Session {
    config: CliConfig,
    root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    package: String,
}

impl Session {
    fn files(&self) -> Result<LocalFileService> {
        let root = self.config.resolve_root(self.root.clone())?;
        Ok(LocalFileService::new(root))
    }

    fn storage(&self) -> Result<Arc<dyn ScopedStorage>> {
        let path = self.config.resolve_database(self.data_dir.clone())?;
        let store = Arc::new(
            SqliteScopedStore::open(&path)
                .with_context(|| format!("Failed to open session store {}", path.display()))?,
        );
        Ok(Arc::new(store.scope(tabs_scope(&self.package))))
    }

    fn workbench(&self, runs: Arc<dyn RunService>) -> Result<Workbench> {
        Ok(Workbench::new(
            self.config.session.clone(),
            Arc::new(self.files()?),
            runs,
            Some(self.storage()?),
        ))
    }

    /// Workbench with restored tabs, for commands that only touch files.
    async fn hydrated_workbench(&self) -> Result<Workbench> {
        let workbench = self.workbench(Arc::new(ReplayRunService::empty()))?;
        workbench.hydrate(None).await;
        Ok(workbench)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        root,
        data_dir,
        package,
        debug,
        command,
    } = Cli::parse();
    let config = CliConfig::load(config.as_deref())?;
    init_logging(debug, config.log_level.as_deref());
    let session = Session {
        config,
        root,
        data_dir,
        package,
    };

    match command {
        Commands::Events { input, json } => print_events(input.as_deref(), json),
        Commands::Run {
            events,
            mode,
            artifacts,
            dry_run,
            json,
        } => replay_run(&session, &events, mode, artifacts, dry_run, json).await,
        Commands::Files => {
            for id in session.files()?.list_files()? {
                println!("{id}");
            }
            Ok(())
        }
        Commands::Tabs => show_tabs(&session),
        Commands::Open { ids } => {
            let workbench = session.hydrated_workbench().await?;
            for id in &ids {
                workbench.tabs().open_file(id).await;
            }
            print_tabs(&workbench);
            Ok(())
        }
        Commands::Close { ids } => {
            let workbench = session.hydrated_workbench().await?;
            for id in &ids {
                if !workbench.tabs().with_tabs(|tabs| tabs.close_tab(id)) {
                    println!("{id} is not open");
                }
            }
            print_tabs(&workbench);
            Ok(())
        }
        Commands::Save { id, from, create } => save_file(&session, &id, &from, create).await,
    }
}

fn init_logging(debug: bool, configured: Option<&str>) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("WB_LOG_LEVEL") {
        level
    } else {
        configured.unwrap_or("info").to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_events(input: Option<&Path>, json: bool) -> Result<()> {
    let events = match input {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open event log {}", path.display()))?;
            read_events(file)?
        }
        _ => read_events(io::stdin().lock())?,
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for envelope in &events {
        let line = translate(envelope);
        if json {
            writeln!(out, "{}", serde_json::to_string(&line)?)?;
        } else {
            writeln!(out, "{line}")?;
        }
    }
    out.flush()?;
    Ok(())
}

async fn replay_run(
    session: &Session,
    events: &Path,
    mode: Option<RunMode>,
    artifacts: Option<PathBuf>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = File::open(events)
        .with_context(|| format!("Failed to open event log {}", events.display()))?;
    let recorded = read_events(file)?;
    info!(event = "replay_loaded", events = recorded.len());

    let workbench = session.workbench(Arc::new(ReplayRunService::new(recorded, artifacts)))?;
    workbench.hydrate(None).await;
    workbench.runs().set_tree_ready(true);

    let mut options = session.config.session.run_options.clone();
    if let Some(mode) = mode {
        options.mode = mode;
    }
    options.dry_run |= dry_run;
    let outcome = workbench
        .runs()
        .start_run(RunRequest::new(session.package.as_str(), options), || true)
        .await;

    for line in workbench.runs().console() {
        println!("{line}");
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&workbench.runs().snapshot())?);
    }

    match outcome {
        RunOutcome::Finished {
            status: RunStatus::Succeeded,
            ..
        } => Ok(()),
        RunOutcome::Finished { run_id, status } => bail!(
            "run {} finished with status {status}",
            run_id.unwrap_or_else(|| "<unknown>".to_string())
        ),
        RunOutcome::Rejected(rejection) => bail!("run rejected: {rejection:?}"),
        RunOutcome::Cancelled => bail!("run cancelled"),
        RunOutcome::StreamFailed { message } => bail!(message),
    }
}

fn show_tabs(session: &Session) -> Result<()> {
    let storage = session.storage()?;
    let Some(snapshot) = storage.get::<TabSetSnapshot>()? else {
        println!("No persisted tabs for {}", session.package);
        return Ok(());
    };
    for tab in &snapshot.open_tabs {
        let marker = if snapshot.active_tab_id.as_deref() == Some(tab.id.as_str()) {
            "*"
        } else {
            " "
        };
        let pinned = if tab.pinned { " [pinned]" } else { "" };
        println!("{marker} {}{pinned}", tab.id);
    }
    Ok(())
}

fn print_tabs(workbench: &Workbench) {
    workbench.tabs().with_tabs(|tabs| {
        let active = tabs.active_tab_id().map(str::to_string);
        for tab in tabs.tabs() {
            let marker = if active.as_deref() == Some(tab.id.as_str()) {
                "*"
            } else {
                " "
            };
            println!("{marker} {}", describe_tab(tab));
        }
    });
}

fn describe_tab(tab: &FileTab) -> String {
    let mut line = format!("{} [{}]", tab.id, tab.status.as_str());
    if tab.pinned {
        line.push_str(" pinned");
    }
    if let Some(etag) = tab.etag.as_deref() {
        line.push_str(&format!(" etag={etag}"));
    }
    if let Some(error) = tab.error.as_deref().or(tab.save_error.as_deref()) {
        line.push_str(&format!(" error={error}"));
    }
    line
}

async fn save_file(session: &Session, id: &str, from: &Path, create: bool) -> Result<()> {
    let content = fs::read_to_string(from)
        .with_context(|| format!("Failed to read {}", from.display()))?;
    let workbench = session.hydrated_workbench().await?;
    workbench.tabs().open_file(id).await;

    let prepared = workbench.tabs().with_tabs(|tabs| {
        let status = tabs.tab(id).map(|tab| tab.status);
        if status == Some(TabStatus::Error) && create {
            tabs.replace_tab_content(id, "", None);
        }
        tabs.update_content(id, content)
    });
    if !prepared {
        let reason = workbench
            .tabs()
            .with_tabs(|tabs| tabs.tab(id).and_then(|tab| tab.error.clone()))
            .unwrap_or_else(|| "not loaded".to_string());
        bail!("{id} could not be opened: {reason}");
    }

    let result = workbench.tabs().save_tab(id).await;
    match result.outcome {
        SaveOutcome::Saved { etag } => println!("saved {id} ({etag})"),
        SaveOutcome::Skipped => println!("{id} is unchanged"),
        SaveOutcome::Conflict { message }
        | SaveOutcome::MissingVersion { message }
        | SaveOutcome::Failed { message } => bail!("{id}: {message}"),
    }
    Ok(())
}
