use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "spirebridge",
    about = "Bridge a game frame loop to an advisor process and overlay viewers",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge against the built-in demo game
    Run {
        /// Advisor command line (overrides [advisor].command)
        #[arg(long)]
        command: Option<String>,

        /// Viewer WebSocket port (overrides [broadcast].port)
        #[arg(long)]
        port: Option<u16>,

        /// Do not start the viewer server
        #[arg(long)]
        no_broadcast: bool,

        /// Stop after this many frames (runs until Ctrl-C otherwise)
        #[arg(long)]
        frames: Option<u64>,
    },

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable listing
        #[arg(long)]
        json: bool,
    },
}
