use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_FILENAME;

#[derive(Debug, Parser)]
#[command(name = "artarget", version, about = "Compile and publish AR image targets")]
pub(crate) struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILENAME)]
    pub config: PathBuf,

    /// Overrides the configured log level.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Compile an image locally and upload the artifact.
    Compile {
        /// Job identifier; also names the uploaded artifact.
        #[arg(long)]
        id: String,
        /// Source image (JPEG or PNG).
        #[arg(long)]
        image: PathBuf,
        /// Overrides the configured compiler program.
        #[arg(long)]
        compiler: Option<PathBuf>,
    },
    /// Start a server-side compilation and wait for it to settle.
    Remote {
        #[arg(long)]
        id: String,
    },
    /// Write a config file holding every default.
    InitConfig {
        #[arg(long)]
        force: bool,
    },
}
