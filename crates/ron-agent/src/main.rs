use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use ron_agent::{control, Agent, AgentConfig, Family};

#[derive(Parser)]
#[command(name = "miniccc", about = "RON agent", version)]
struct Cli {
    /// Controller port.
    #[arg(long, default_value_t = 9002)]
    port: u16,

    /// Controller host (tcp) or socket path (unix).
    #[arg(long, default_value = "localhost")]
    parent: String,

    /// Transport family: tcp or unix.
    #[arg(long, default_value = "tcp")]
    family: String,

    /// Serial device to dial instead of a network parent.
    #[arg(long)]
    serial: Option<PathBuf>,

    /// Base directory for files, responses, and the control socket.
    #[arg(long, default_value = "/tmp/miniccc")]
    path: PathBuf,

    /// Set a tag on an already-running agent: --tag key value
    #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"])]
    tag: Option<Vec<String>>,

    /// Attach stdin/stdout to a named pipe on a running agent.
    #[arg(long)]
    pipe: Option<String>,

    /// Verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log to this file instead of stderr.
    #[arg(long)]
    logfile: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Control-socket client modes talk to an agent that already runs.
    if let Some(pair) = &cli.tag {
        control::send_tag(&cli.path, &pair[0], &pair[1])
            .await
            .context("setting tag")?;
        return Ok(());
    }
    if let Some(pipe) = &cli.pipe {
        control::pipe_client(&cli.path, pipe)
            .await
            .context("attaching pipe")?;
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let (filter, reload_handle) = reload::Layer::new(filter);

    match &cli.logfile {
        Some(logfile) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logfile)
                .context("opening logfile")?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Arc::new(file))
                        .with_ansi(false),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let mut config = AgentConfig::new(cli.parent, cli.port).base(cli.path);
    config = match cli.family.as_str() {
        "unix" => config.family(Family::Unix),
        _ => config,
    };
    if let Some(device) = cli.serial {
        config = config.serial(device);
    }

    let agent = Agent::new(config)?;
    agent.set_level_reload(Box::new(move |level| {
        let directive = level.as_directive();
        if let Err(e) = reload_handle.reload(EnvFilter::new(directive)) {
            tracing::warn!("log level reload: {e}");
        }
    }));

    agent.run().await?;
    Ok(())
}
