mod rtunnel;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "rtunnel", version, about = "rtunnel - reverse tunnel relay and client")]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses RTUNNEL_CONFIG; then auto-detects rtunnel.toml > rtunnel.yaml > rtunnel.yml from CWD; then falls back to the OS default path (Linux: /etc/rtunnel/rtunnel.toml; others: user config dir).
    #[arg(long, env = "RTUNNEL_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    rtunnel::run(cli.config).await
}
