use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "windsock", version, about = "WebSocket gateway for a ZeroMQ broker")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./windsock.toml")]
    pub config: PathBuf,

    /// Log level (overrides config file setting, ignored when RUST_LOG is set)
    #[arg(long, env = "WINDSOCK_LOG_LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a token signed with the configured secret, issued now
    Token {
        /// Identity the token is issued to
        #[arg(long)]
        identity: String,

        /// Address prefix the holder receives messages for
        #[arg(long)]
        subscribe: String,

        /// Address prefix the holder's messages are published under
        #[arg(long)]
        publish: String,

        /// Nonce field, random when omitted
        #[arg(long)]
        nonce: Option<String>,

        /// Claimed source address field
        #[arg(long, default_value = "")]
        address: String,
    },
}
