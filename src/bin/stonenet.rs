use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use stonenet::{
    setup_tracing, AppResult, Chat, MessageRouter, Node, ServerConfig, ServerHandle,
};
use tracing::debug;

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
}

fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Every chat line is relayed to every connected client, sender included.
fn chat_relay() -> MessageRouter {
    MessageRouter::new().route(
        |server: ServerHandle, session_id: String, chat: Chat| async move {
            let delivered = server.broadcast(&chat)?;
            debug!(session_id, delivered, "chat relayed");
            Ok(())
        },
    )
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let server_config = ServerConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", server_config);
        return Ok(());
    }

    let _log_guard = setup_tracing("logs", log_level(commandline.verbose))?;

    Node::new(server_config, chat_relay()).start()
}
