//! `autonomicd` — operator CLI for the autonomic agent runtime.
//!
//! Subcommands: `run` (one-shot Pulse turn), `serve` (long-running heartbeat +
//! stdin/stdout NDJSON turns), `status`, `clear`, `stop`, `use`, `auto_route`,
//! `mcp`, `dev_mode`, `tools`, `graph_status`.

use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use core::pulse::phases::HistoryTurn;

use autonomic_cli::logging;
use autonomic_cli::runtime::{self, Runtime};

#[derive(Parser, Debug)]
#[command(name = "autonomicd")]
#[command(about = "Operator CLI for the autonomic agent runtime")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// Work directory (memory streams, config overlay, stop signal). Default: ./work
    #[arg(long, value_name = "DIR", global = true)]
    work_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run one Pulse turn and print the reply
    Run {
        /// User message (or pass as trailing positional args)
        #[arg(short, long, value_name = "TEXT")]
        message: Option<String>,
        #[arg(trailing_var_arg = true)]
        rest: Vec<String>,
        /// Chat id for session continuity (default: "cli")
        #[arg(long, default_value = "cli")]
        chat_id: String,
        /// Output the reply as a JSON object instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Run the Autonomic Engine heartbeat and accept turns over stdin (one
    /// newline-delimited JSON object per line: `{"chat_id": "...", "message": "..."}`,
    /// replying with `{"reply": "..."}` on stdout)
    Serve,
    /// Print the Autonomic Engine's persisted status as JSON
    Status,
    /// Reset the persisted config overlay to defaults
    Clear,
    /// Signal a running `serve` process to stop at its next heartbeat
    Stop,
    /// Switch the active model (persisted)
    Use {
        model: String,
    },
    /// Toggle auto-routing of complex turns to the configured model
    AutoRoute {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Reload MCP server connections (signals a running `serve` process)
    Mcp {
        #[command(subcommand)]
        action: McpAction,
    },
    /// Toggle dev-explore mode (faster timing profile, relaxed stasis gating)
    DevMode {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// List the built-in tool actions the dispatcher handles directly
    Tools,
    /// Print memory-graph stream sizes (entities/relations/knowledge)
    GraphStatus,
}

#[derive(Subcommand, Debug, Clone)]
enum McpAction {
    Reload,
}

fn work_dir(args: &Args) -> PathBuf {
    args.work_dir.clone().unwrap_or_else(|| PathBuf::from("work"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_and_apply("autonomic", None::<&std::path::Path>).ok();
    logging::init()?;

    let args = Args::parse();
    let work_root = work_dir(&args);
    std::fs::create_dir_all(&work_root)?;
    let store = config::state::ConfigStore::new(&work_root);
    store.load_into_env().ok();

    match args.cmd {
        Command::Run { message, rest, chat_id, json } => {
            let text = message.or_else(|| if rest.is_empty() { None } else { Some(rest.join(" ")) });
            let Some(text) = text else {
                eprintln!("autonomicd: provide a message via -m/--message or positional args");
                std::process::exit(1);
            };
            let rt = Runtime::build(&work_root)?;
            let history: Vec<HistoryTurn> = Vec::new();
            let reply = rt.pulse.handle_user_message(&chat_id, &text, &history).await?;
            if json {
                println!("{}", serde_json::json!({ "reply": reply }));
            } else {
                println!("{reply}");
            }
            std::io::stdout().flush().ok();
        }
        Command::Serve => {
            let rt = Runtime::build(&work_root)?;
            let stop_file = work_root.join("stop.signal");
            let engine_handle = {
                let engine = rt.engine.clone();
                let stop_file = stop_file.clone();
                tokio::spawn(async move {
                    engine.run_forever(|| stop_file.exists()).await;
                })
            };

            let stdin = tokio::io::stdin();
            let mut lines = tokio::io::AsyncBufReadExt::lines(tokio::io::BufReader::new(stdin));
            loop {
                if stop_file.exists() {
                    break;
                }
                match tokio::time::timeout(std::time::Duration::from_millis(500), lines.next_line()).await {
                    Ok(Ok(Some(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let turn: serde_json::Value = match serde_json::from_str(&line) {
                            Ok(v) => v,
                            Err(e) => {
                                println!("{}", serde_json::json!({ "error": e.to_string() }));
                                continue;
                            }
                        };
                        let chat_id = turn.get("chat_id").and_then(|v| v.as_str()).unwrap_or("default").to_string();
                        let message = turn.get("message").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        rt.engine.touch();
                        let reply = rt.pulse.handle_user_message(&chat_id, &message, &[]).await?;
                        println!("{}", serde_json::json!({ "chat_id": chat_id, "reply": reply }));
                        std::io::stdout().flush().ok();
                    }
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => return Err(Box::new(e)),
                    Err(_) => continue,
                }
            }
            let _ = std::fs::write(&stop_file, "");
            engine_handle.abort();
        }
        Command::Status => {
            let rt = Runtime::build(&work_root)?;
            let status = rt.engine.get_status();
            println!(
                "{}",
                serde_json::json!({
                    "dev_explore": status.dev_explore,
                    "paused": status.paused,
                    "stasis_active": status.stasis_active,
                    "idle_seconds": status.idle_seconds,
                    "level_done": status.level_done,
                    "pending_alerts": status.pending_alerts,
                })
            );
        }
        Command::Clear => {
            let state_file = work_root.join("config_state.json");
            if state_file.exists() {
                std::fs::remove_file(&state_file)?;
            }
            println!("config overlay cleared");
        }
        Command::Stop => {
            std::fs::write(work_root.join("stop.signal"), "")?;
            println!("stop signal written; a running serve process will exit at its next heartbeat");
        }
        Command::Use { model } => {
            store.set("AUTONOMIC_MODEL", &model)?;
            println!("model set to {model}");
        }
        Command::AutoRoute { state } => {
            store.set("AUTONOMIC_AUTO_ROUTE", if state == "on" { "true" } else { "false" })?;
            println!("auto_route: {state}");
        }
        Command::Mcp { action: McpAction::Reload } => {
            std::fs::write(work_root.join("mcp_reload.signal"), "")?;
            println!("mcp reload signal written; picked up by a running serve process");
        }
        Command::DevMode { state } => {
            let on = state == "on";
            store.set("AUTONOMIC_DEV_EXPLORE", if on { "true" } else { "false" })?;
            store.set("AUTONOMIC_PROFILE", if on { "dev" } else { "prod" })?;
            println!("dev_mode: {state}");
        }
        Command::Tools => {
            for action_id in runtime::BUILTIN_ACTIONS {
                println!("{action_id}");
            }
        }
        Command::GraphStatus => {
            let rt = Runtime::build(&work_root)?;
            use core::storage::Stream;
            let entities: usize = rt.storage.read::<serde_json::Value>(Stream::Entities, None)?.len();
            let relations: usize = rt.storage.read::<serde_json::Value>(Stream::Relations, None)?.len();
            let knowledge: usize = rt.storage.read::<serde_json::Value>(Stream::Knowledge, None)?.len();
            println!("{}", serde_json::json!({ "entities": entities, "relations": relations, "knowledge": knowledge }));
        }
    }
    Ok(())
}
