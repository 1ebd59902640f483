//! CLI for mqttd
//!
//! Loads configuration, applies command line overrides and runs the broker
//! until it fails or receives Ctrl-C.

use clap::Parser;
use mqttd::config::{Settings, load_config, load_config_from};
use mqttd::utils::{BrokerError, logging};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mqttd", about = "MQTT 3.1.1 broker")]
struct Args {
    /// Address to bind
    #[arg(short = 'H', long)]
    host: Option<String>,
    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,
    /// Seconds a new connection may take to send CONNECT
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
    /// Configuration file to load instead of config/default
    #[arg(short, long)]
    config: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(timeout) = self.timeout {
            settings.broker.connect_timeout_secs = timeout;
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    logging::init(logging::level_for(args.verbose));

    if let Err(e) = run_server(&args).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run_server(args: &Args) -> Result<(), BrokerError> {
    let mut settings = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    args.apply(&mut settings);
    info!(
        "Start server on {}:{}",
        settings.server.host, settings.server.port
    );

    tokio::select! {
        result = mqttd::run(&settings) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    }
}
