use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rustlite-probe", about = "Run TLS, mTLS and WebSocket diagnostic probes")]
pub struct Cli {
    /// JSON file holding one test definition or an array of them
    #[arg(short, long, value_name = "FILE")]
    pub definition: String,

    /// Username placed in the execution context
    #[arg(long)]
    pub username: Option<String>,

    /// Name of an environment variable holding the password / PFX passphrase
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,

    /// Only run definitions with these ids (repeatable)
    #[arg(long = "only", action = ArgAction::Append, value_name = "ID")]
    pub only: Vec<String>,

    /// Print results as JSON instead of text
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Write all results as JSON to this file
    #[arg(long, value_name = "FILE", default_value_t = String::new())]
    pub json_out: String,
}

impl Cli {
    pub fn parse() -> Self {
        Parser::parse()
    }
}
