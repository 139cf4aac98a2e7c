use acp_client::logging::{LogConfig, init_logging};
use acp_client::{AcpClient, AcpError, ClientInfo, ConnectionBuilder, ProcessConfig};

use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Spawn an ACP agent, perform the handshake and print what it reports
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides ACP_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Seconds to wait for each handshake response
    #[arg(long, value_name = "SECS", default_value_t = 30)]
    timeout: u64,

    /// Working directory for the new session (defaults to current directory)
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Agent command followed by its arguments
    #[arg(last = true, required = true, num_args = 1.., value_name = "AGENT")]
    agent: Vec<String>,
}

async fn handshake(client: &AcpClient, cwd: &Path) -> Result<Value, AcpError> {
    let result = client.initialize(Some(ClientInfo::default())).await?;
    let session_id = client.new_session(cwd).await?;
    info!("Created session {}", session_id);
    Ok(result)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let cwd = match args.cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let Some((command, agent_args)) = args.agent.split_first() else {
        eprintln!("No agent command given");
        std::process::exit(2);
    };
    let config = ProcessConfig::new(command).args(agent_args.iter().cloned());

    let builder = ConnectionBuilder::new()
        .on_session_update(|update| {
            debug!("Session update: {}", update);
            Ok(())
        })
        .on_disconnect(|_| warn!("Agent closed its output"));

    let client =
        AcpClient::spawn(config, builder)?.with_request_timeout(Duration::from_secs(args.timeout));

    let outcome = handshake(&client, &cwd).await;
    client.close().await?;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
