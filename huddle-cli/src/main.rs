//! Huddle CLI binary: join a room on the shared filesystem tree and chat, with `/ai`,
//! `/memory`, `/actions`, and `/agent` command surfaces (§6).

use std::path::PathBuf;

use clap::Parser;
use tokio::time::interval;

use huddle_cli::{repl, AppContext};
use huddle_core::presence::{Presence, PRESENCE_HEARTBEAT_INTERVAL};

#[derive(Parser, Debug)]
#[command(name = "huddle", about = "Multi-user terminal chat over a shared filesystem tree")]
struct Cli {
    /// Shared tree root (rooms/, memory/global.jsonl, agents/). Defaults to ./huddle_data.
    #[arg(long, env = "HUDDLE_BASE_DIR", default_value = "./huddle_data")]
    base_dir: PathBuf,

    /// Private/per-machine state directory (ai_config.json, memory/{private,repo}.jsonl).
    #[arg(long, env = "HUDDLE_LOCAL_DIR", default_value = "./.local_chat")]
    local_dir: PathBuf,

    /// Room name to join.
    #[arg(long, default_value = "general")]
    room: String,

    /// Display name used for chat authorship and presence.
    #[arg(long, env = "HUDDLE_NAME")]
    name: Option<String>,

    /// Display color for presence (a terminal hint, not interpreted by the core).
    #[arg(long, default_value = "white")]
    color: String,

    /// Send a single message non-interactively and exit instead of starting the REPL.
    #[arg(short = 'm', long)]
    message: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let _ = huddle_config::load_and_apply("huddle", None);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(huddle_cli::log_format::TextWithSpanIds::new())
        .init();

    let cli = Cli::parse();
    let author = cli.name.unwrap_or_else(|| std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string()));

    let ctx = AppContext::bootstrap(cli.base_dir, cli.local_dir, cli.room.clone(), author.clone(), cli.color.clone()).await?;

    if let Some(message) = cli.message {
        let reply = huddle_cli::commands::handle_line(&ctx, &message).await;
        if !reply.is_empty() {
            println!("{reply}");
        }
        return Ok(());
    }

    let storage = ctx.storage.clone();
    let room = ctx.room.clone();
    let client_id = ctx.client_id.clone();
    let name = author.clone();
    let color = ctx.color.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = interval(PRESENCE_HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            let presence = Presence::new(&storage);
            if let Err(e) = presence.heartbeat(&room, &client_id, &name, &color, "online").await {
                tracing::warn!(error = %e, "presence heartbeat failed");
            }
        }
    });

    {
        let presence = Presence::new(&ctx.storage);
        presence.heartbeat(&ctx.room, &ctx.client_id, &author, &ctx.color, "online").await?;
    }

    let result = repl::run_repl_loop(&ctx).await;
    heartbeat_task.abort();
    result
}
