use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "livechat-server", about = "Realtime support conversation server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/livechat.toml")]
    pub config: String,

    /// Listen address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,
}
