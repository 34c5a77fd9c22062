mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

use changeflow_core::config::load_dotenv;

use crate::cli::{CliArgs, Command, TokenAction};

fn main() -> Result<()> {
    load_dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();

    match args.command {
        Command::Parse { input, pretty } => commands::parse(&input, pretty),
        Command::Token { action } => match action {
            TokenAction::Encode {
                source,
                correlation_id,
                job_execution_id,
            } => commands::encode_token(&source, correlation_id.as_deref(), job_execution_id),
            TokenAction::Decode { token } => commands::decode_token(&token),
        },
        Command::Config => commands::show_config(args.profile.as_deref()),
    }
}
