use clap::{Parser, Subcommand};

/// Inspect change-event payloads, tracking tokens and configuration.
#[derive(Parser, Debug)]
#[command(name = "changeflow", about = "Tools for the changeflow event engine", version)]
pub struct CliArgs {
    /// Config profile (e.g. PROD). Keys are read as {PROFILE}_{KEY}, falling back to {KEY}
    #[arg(long, env = "CHANGEFLOW_PROFILE", global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse a webhook payload and print the normalized change event as JSON
    Parse {
        /// Payload file, or `-` for stdin
        #[arg(default_value = "-")]
        input: String,

        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },

    /// Build or inspect tracking tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand, Debug)]
pub enum TokenAction {
    /// Build a token for a new lineage
    Encode {
        /// Name of whatever started the lineage (usually an event name)
        #[arg(long)]
        source: String,

        /// Correlation id (generated when omitted or malformed)
        #[arg(long)]
        correlation_id: Option<String>,

        /// Job execution id (generated when omitted)
        #[arg(long)]
        job_execution_id: Option<String>,
    },

    /// Validate a token and print its fields
    Decode {
        token: String,
    },
}
