use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "arena-server", about = "Arena lobby gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/arena.toml")]
    pub config: String,

    /// Address to listen on (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}
