use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "prlfleet",
    version,
    about = "Provision fleets of Parallels VMs from templates, images, snapshots or ISOs"
)]
pub struct Cli {
    /// Path to the fleet config file
    #[arg(short, long, global = true, default_value = "fleet.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Auto)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create, configure and start VMs, then wait until they are ready
    Up {
        /// VMs to provision (default: all). Dependencies are included.
        names: Vec<String>,
    },

    /// Stop and delete VMs and their seed media
    Destroy {
        /// VMs to destroy (default: all)
        names: Vec<String>,
    },

    /// Show the current hypervisor state of VMs
    Status {
        /// VMs to show (default: all)
        names: Vec<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Interactive on a terminal, plain otherwise
    Auto,
    Interactive,
    Plain,
    Json,
}
