use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use common::models::{InferenceOptions, ModelIdentity};
use common::utils::format_bytes;
use modelhub::ModelHub;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./modelhub.toml when present)
    #[arg(short, long, env = "MODELHUB_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show source reachability and daemon state
    Status,

    /// List local models of every source
    List,

    /// Describe a model as its source reports it
    Info {
        /// Model identifier; bare names use the default source
        model: String,
    },

    /// Download a model, e.g. `hub:gpt2` or `daemon:llama3`
    Download {
        /// Model identifier; bare names use the default source
        model: String,
    },

    /// Load a model and run one prompt against it
    Infer {
        model: String,
        prompt: String,

        /// Download the model first when it is missing
        #[arg(long)]
        pull: bool,

        #[arg(long)]
        max_tokens: Option<u32>,

        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Delete a downloaded model
    Delete { model: String },

    /// Manage the local daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Prepare startup models and supervise the daemon until interrupted
    Serve,
}

#[derive(Subcommand)]
enum DaemonCommand {
    /// Install the daemon binary
    Install,
    /// Run the daemon in the foreground until interrupted
    Start,
    /// Show the daemon state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = hub_config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _log_guard = logging::init(&settings.logging)?;

    let hub = ModelHub::new(settings).context("failed to initialize ModelHub")?;
    let service = hub.service();

    match cli.command {
        Commands::Status => {
            let status = service.status().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for source in &status.sources {
                    let reachable = if source.available { "reachable" } else { "unreachable" };
                    println!("{:<8} {}", source.source.to_string(), reachable);
                }
                if let Some(daemon) = &status.daemon {
                    println!("daemon   {}", daemon);
                }
            }
        }

        Commands::List => {
            let models = service.list_models().await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                for model in models {
                    let size = model.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
                    println!("{:<48} {:>10}  {}", model.identity.to_string(), size, model.state);
                }
            }
        }

        Commands::Info { model } => {
            let identity = parse_model(&hub, &model)?;
            let info = service.info(&identity).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                let size = info.size_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
                let local = if info.present_locally { "local" } else { "remote" };
                println!("{}  {}  {}", info.identity, local, size);
                for (key, value) in &info.metadata {
                    println!("  {:<20} {}", key, value);
                }
            }
        }

        Commands::Download { model } => {
            let identity = parse_model(&hub, &model)?;
            let state = service.download(&identity).await?.wait().await?;
            println!("{} {}", identity, state);
        }

        Commands::Infer {
            model,
            prompt,
            pull,
            max_tokens,
            temperature,
        } => {
            let identity = parse_model(&hub, &model)?;

            if pull {
                service.download(&identity).await?.wait().await?;
            }

            service.load(&identity).await?;

            let options = InferenceOptions {
                max_tokens,
                temperature,
                ..InferenceOptions::default()
            };
            let output = service.infer(&identity, &prompt, &options).await;

            if let Err(e) = service.unload(&identity).await {
                warn!("Failed to unload {}: {}", identity, e);
            }
            println!("{}", output?);
        }

        Commands::Delete { model } => {
            let identity = parse_model(&hub, &model)?;
            service.delete(&identity).await?;
            println!("Deleted {}", identity);
        }

        Commands::Daemon { command } => match command {
            DaemonCommand::Install => {
                service.install_daemon().await?;
                println!("Daemon installed");
            }
            DaemonCommand::Start => {
                service.start_daemon().await?;
                println!("Daemon running at {}", hub.settings().daemon.endpoint);

                wait_for_ctrl_c().await?;
                hub.shutdown().await?;
            }
            DaemonCommand::Status => {
                let state = service.daemon_status().await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&state)?);
                } else {
                    println!("{}", state);
                }
            }
        },

        Commands::Serve => {
            let (outcomes, monitor) = hub.start().await;
            let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
            info!(
                "{} startup models ready, {} unavailable",
                outcomes.len() - failed,
                failed
            );

            wait_for_ctrl_c().await?;
            hub.shutdown().await?;
            if let Some(monitor) = monitor {
                let _ = monitor.await;
            }
        }
    }

    Ok(())
}

fn parse_model(hub: &ModelHub, raw: &str) -> Result<ModelIdentity> {
    ModelIdentity::parse_with_default(raw, hub.settings().default_source)
        .with_context(|| format!("invalid model identifier '{}'", raw))
}

async fn wait_for_ctrl_c() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");
    Ok(())
}
