use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "space-bridge",
    version,
    about = "Bridges Discord guilds and Matrix spaces to a shared data space"
)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the bridge (default)
    Run,
    /// Write the Matrix appservice registration file and exit
    GenerateRegistration {
        #[arg(long, short, default_value = "registration.yaml")]
        output: PathBuf,
    },
}

impl Cli {
    pub fn command(&self) -> &CliCommand {
        self.command.as_ref().unwrap_or(&CliCommand::Run)
    }
}
