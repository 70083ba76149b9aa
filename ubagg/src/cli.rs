use clap::{Parser, Subcommand};
use std::path::PathBuf;
use ubagg_core::Eid;

/// ubagg - bonding reliability layer operator tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Override config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the config file path
    PrintConfigPath,
    /// Initialize a default config file
    InitConfig {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
    /// Load and validate the config file
    CheckConfig,
    /// List the direct routes the current node has in a topology
    Routes {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,
    },
    /// Find the bonding device that owns an endpoint id
    Resolve {
        /// Topology file (TOML)
        #[arg(short, long)]
        topology: PathBuf,
        /// Endpoint id, written as an IPv6 address
        eid: Eid,
    },
    /// Push traffic between two in-process bonding jettys using the config
    Selftest {
        /// Member devices per side
        #[arg(short, long, default_value_t = 2)]
        members: usize,
        /// Sends to push through
        #[arg(short, long, default_value_t = 64)]
        count: u32,
        /// Fail member 0 halfway through
        #[arg(long)]
        fail_member: bool,
    },
}
