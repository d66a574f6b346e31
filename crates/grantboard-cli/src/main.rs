use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grantboard_core::CategoryFilter;
use grantboard_session::{start_from_config, BoardConfig, BoardState, BoardView, Session};
use grantboard_storage::{resolve_admin, AdminToggle, FileKeyValueStore};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "grantboard")]
#[command(about = "Browse, bookmark and curate funding opportunities")]
struct Cli {
    /// URL or file path of the opportunity document.
    #[arg(long, global = true)]
    source: Option<String>,
    /// Directory holding the persisted discard ledger and admin flag.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web board.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the visible opportunities.
    List {
        #[arg(long, default_value = "")]
        search: String,
        /// `all`, `saved` or a category code.
        #[arg(long, default_value = "all")]
        category: String,
        #[arg(long)]
        json: bool,
    },
    /// Print one opportunity in full.
    Show { id: String },
    /// Hide an opportunity permanently (admin only).
    Discard {
        id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Set (`true`) or clear (`false`) the admin capability.
    Admin { state: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("grantboard=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = BoardConfig::from_env();
    if let Some(source) = cli.source {
        config.source = source;
    }
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config.web_port = port;
            }
            grantboard_web::serve(&config).await?;
        }
        Commands::List {
            search,
            category,
            json,
        } => {
            let mut board = start_from_config(&config, AdminToggle::Keep).await?;
            let session = ready(&mut board)?;
            session.on_search_changed(search);
            let view = session.on_category_selected(CategoryFilter::parse(&category));
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_view(&view);
            }
        }
        Commands::Show { id } => {
            let mut board = start_from_config(&config, AdminToggle::Keep).await?;
            let session = ready(&mut board)?;
            let opportunity = session
                .on_record_selected(&session.resolve_id(&id))
                .with_context(|| format!("looking up opportunity {id}"))?;
            println!("[{}] {}", opportunity.category.heading(), opportunity.title);
            println!("org:      {}", opportunity.org);
            println!("deadline: {}", opportunity.deadline);
            println!("amount:   {}", opportunity.amount);
            println!("link:     {}", opportunity.link);
            if !opportunity.desc.is_empty() {
                println!();
                println!("{}", opportunity.desc);
            }
        }
        Commands::Discard { id, yes } => {
            let mut board = start_from_config(&config, AdminToggle::Keep).await?;
            let session = ready(&mut board)?;
            let id = session.resolve_id(&id);
            if !session.is_admin() {
                bail!("discarding requires admin mode; run `grantboard admin true` first");
            }
            if !yes && !confirm(&format!("Hide opportunity {id} permanently? [y/N] "))? {
                eprintln!("cancelled");
                return Ok(());
            }
            let view = session.on_discard(&id)?;
            info!(%id, remaining = view.visible.len(), "discard recorded");
            println!("discarded {id}; {} opportunities remain visible", view.visible.len());
        }
        Commands::Admin { state } => {
            let toggle = AdminToggle::from_arg(Some(state.as_str()));
            if toggle == AdminToggle::Keep {
                bail!("expected `true` or `false`, got {state:?}");
            }
            let mut store = FileKeyValueStore::open(&config.state_dir)?;
            let is_admin = resolve_admin(&mut store, toggle)?;
            println!("admin mode: {}", if is_admin { "on" } else { "off" });
        }
    }

    Ok(())
}

fn ready(board: &mut BoardState) -> Result<&mut Session> {
    match board {
        BoardState::Ready(session) => Ok(session),
        BoardState::LoadFailed(err) => bail!(
            "could not load the opportunity list ({err}); check GRANTBOARD_SOURCE or --source and try again"
        ),
    }
}

fn print_view(view: &BoardView) {
    if view.visible.is_empty() {
        println!("no results");
    }
    for o in &view.visible {
        let mark = if o.saved { "*" } else { " " };
        println!(
            "{mark} {:>6}  {:<14} {}  ({}; {}; {})",
            o.id.to_string(),
            o.category.label(),
            o.title,
            o.org,
            o.deadline,
            o.amount
        );
    }
    println!(
        "{} visible, {} saved{}",
        view.visible.len(),
        view.saved_count,
        if view.is_admin { ", admin" } else { "" }
    );
}

fn confirm(prompt: &str) -> Result<bool> {
    let mut stderr = std::io::stderr();
    stderr.write_all(prompt.as_bytes())?;
    stderr.flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "s" | "sim"))
}
