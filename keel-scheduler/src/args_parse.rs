use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "keel-scheduler")]
#[command(about = "Places topic partitions on a live broker fleet")]
#[command(version)]
pub(crate) struct Args {
    /// Path to the YAML config file
    #[arg(long)]
    pub(crate) config_file: String,

    /// JSON-lines file of broker heartbeats, read once at startup
    #[arg(long)]
    pub(crate) heartbeat_file: Option<String>,

    /// Prometheus exporter address, overrides the config file
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,
}
