use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "parley-server", about = "Parley chat server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/parley.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and gateway server (default)
    Serve,
    /// Print a signed token for a user, for local testing
    IssueToken {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        username: String,
    },
}
