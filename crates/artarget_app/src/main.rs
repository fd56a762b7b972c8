mod cli;
mod config;
mod run;

use std::process::ExitCode;

use anyhow::Context;
use artarget_logging::pipeline_info;
use clap::Parser;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::InitConfig { force } = &cli.command {
        config::write_default_config(&cli.config, *force)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = config::load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    let level = config.log.level_filter()?;
    artarget_logging::initialize(&config.log.destination(), level);
    pipeline_info!("artarget starting with config {:?}", cli.config);

    match cli.command {
        Command::Compile {
            id,
            image,
            compiler,
        } => {
            if let Some(program) = compiler {
                config.compiler.program = program;
            }
            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("failed to read {}", image.display()))?;
            let name = image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            run::compile(&config, id, name, bytes).await
        }
        Command::Remote { id } => run::remote(&config, &id).await,
        Command::InitConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}
