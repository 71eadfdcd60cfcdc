use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wikinotes_lib::links;
use wikinotes_lib::ollama::OllamaClient;
use wikinotes_lib::settings::{self, DATA_DIR_ENV};
use wikinotes_lib::{setup, TreeNode, Workspace};

#[derive(Parser)]
#[command(name = "wikinotes", version, about = "Markdown notes with wiki links and prompt annotations")]
struct Cli {
    /// Base directory holding `obclonedata/`, `keys/` and `settings.json`
    #[arg(long, env = DATA_DIR_ENV, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Print the note tree")]
    List,
    #[command(about = "Open today's journal entry, creating it if needed")]
    Today,
    #[command(about = "Print a note")]
    Show { id: String },
    #[command(about = "List a note's links, creating missing targets")]
    Links { id: String },
    #[command(about = "List available prompt templates")]
    Prompts,
    #[command(about = "Answer every @#prompt marker in a note")]
    Annotate { id: String },
    #[command(about = "Move a note and retarget links to it")]
    Rename { old: String, new: String },
    #[command(about = "Move a note to the trash")]
    Trash { id: String },
    #[command(about = "List trashed notes")]
    Trashed,
    #[command(about = "Restore a trashed note by its trash file name")]
    Restore { name: String },
    #[command(about = "Permanently delete a trashed note")]
    Purge { name: String },
    #[command(about = "Full-text search")]
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(about = "Keep running: apply external edits and auto-save until Ctrl-C")]
    Watch,
    #[command(about = "Print settings; with flags, update settings.json")]
    Config {
        /// Folder holding the prompt templates
        #[arg(long)]
        templates: Option<PathBuf>,
        #[arg(long)]
        ollama_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let base = settings::resolve_base(cli.data_dir)?;
    let watch = matches!(cli.command, Commands::Watch);
    let (settings, mut ws) = setup(&base, watch)?;

    let result = run(cli.command, &base, &settings, &mut ws).await;
    let flushed = ws.shutdown(Instant::now()).context("saving notes on exit");
    result.and(flushed.map(|_| ()))
}

async fn run(
    command: Commands,
    base: &Path,
    settings: &settings::Settings,
    ws: &mut Workspace,
) -> Result<()> {
    match command {
        Commands::List => {
            print_tree(&ws.notes().list()?, 0);
        }
        Commands::Today => {
            let note = ws.open_today(Instant::now())?;
            println!("{}", note.path.display());
        }
        Commands::Show { id } => {
            let note = ws.open_note(&id, Instant::now())?;
            print!("{}", note.content);
        }
        Commands::Links { id } => {
            let text = ws.open_note(&id, Instant::now())?.content.clone();
            for target in links::targets(&text) {
                let existed = ws.notes().exists(&target);
                ws.follow_link(&target, Instant::now())?;
                println!("{}{}", target, if existed { "" } else { "  (created)" });
            }
        }
        Commands::Prompts => {
            for name in ws.prompt_names() {
                println!("{}", name);
            }
        }
        Commands::Annotate { id } => {
            let client = OllamaClient::from_settings(&settings.ollama);
            if !client.is_available().await {
                warn!(url = %settings.ollama.base_url, "ollama not reachable, markers will be answered with failures");
            }
            ws.open_note(&id, Instant::now())?;
            if !ws.annotate(&id)? {
                println!("no pending markers in {}", id);
                return Ok(());
            }
            let warnings = ws.finish_annotations(Instant::now()).await;
            ws.flush(&id, Instant::now())?;
            for warning in warnings {
                println!("warning: {:?}", warning);
            }
            if let Some(note) = ws.notes().note(&id) {
                print!("{}", note.content);
            }
        }
        Commands::Rename { old, new } => {
            ws.rename(&old, &new, Instant::now())?;
            println!("{} -> {}", old, new);
        }
        Commands::Trash { id } => {
            let name = ws.trash(&id)?;
            println!("{}", name);
        }
        Commands::Trashed => {
            for entry in ws.list_trash()? {
                println!("{}\t{}", entry.file_name, entry.original_id);
            }
        }
        Commands::Restore { name } => {
            let id = ws.restore(&name)?;
            println!("{}", id);
        }
        Commands::Purge { name } => {
            ws.purge(&name)?;
        }
        Commands::Search { query, limit } => {
            for hit in ws.search(&query, limit)? {
                println!("{}\t{}\t{}", hit.id, hit.title, hit.preview);
            }
        }
        Commands::Watch => watch_loop(ws).await?,
        Commands::Config {
            templates,
            ollama_url,
            model,
        } => configure(base, templates, ollama_url, model)?,
    }
    Ok(())
}

async fn watch_loop(ws: &mut Workspace) -> Result<()> {
    info!("watching for changes, Ctrl-C to stop");
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = interval.tick() => {
                let report = ws.tick(Instant::now());
                for id in &report.saved {
                    info!(id = %id, "saved");
                }
                for e in &report.failed {
                    warn!(error = %e, "save failed");
                }
            }
        }
    }
    Ok(())
}

fn configure(
    base: &Path,
    templates: Option<PathBuf>,
    ollama_url: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let mut settings = settings::load_settings(base);
    if settings.apply_overrides(templates, ollama_url, model)? {
        settings.save(base)?;
        info!(path = %settings::settings_path(base).display(), "settings saved");
    }
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

fn print_tree(nodes: &[TreeNode], depth: usize) {
    for node in nodes {
        match node {
            TreeNode::Folder { name, children, .. } => {
                println!("{}{}/", "  ".repeat(depth), name);
                print_tree(children, depth + 1);
            }
            TreeNode::Note { name, .. } => println!("{}{}", "  ".repeat(depth), name),
        }
    }
}
