use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use promptrelay_core::{
    client::RelayClient,
    config::Config,
    model::OptimizeRequest,
    server::{self, AppState},
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "prompt optimizer relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// JSON or TOML config file; environment variables override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Listen address, e.g. 127.0.0.1:5000
        #[arg(long)]
        bind: Option<String>,
    },
    /// Optimize a prompt through a running relay
    Optimize {
        #[arg(long, default_value = "http://127.0.0.1:5000")]
        relay: String,
        #[arg(short, long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
    },
    /// Stream an optimization (prints increments live, Ctrl-C aborts)
    Stream {
        #[arg(long, default_value = "http://127.0.0.1:5000")]
        relay: String,
        #[arg(short, long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
    },
}

fn build_request(
    prompt: String,
    system: Option<String>,
    purpose: Option<String>,
) -> OptimizeRequest {
    let mut req = OptimizeRequest::new(prompt);
    if let Some(s) = system {
        req = req.with_system_prompt(s);
    }
    if let Some(p) = purpose {
        req = req.with_purpose(p);
    }
    req
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut cfg = match config {
                Some(path) => Config::from_path(path)?.apply_process_env()?,
                None => Config::from_env()?,
            };
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            tracing::info!(
                model = %cfg.upstream.model,
                base_url = %cfg.upstream.base_url,
                "starting relay"
            );
            let state = AppState::from_config(&cfg);
            server::serve(&cfg, state).await?;
        }
        Commands::Optimize { relay, prompt, system, purpose } => {
            let client = RelayClient::new(relay)?;
            let out = client.optimize(&build_request(prompt, system, purpose)).await?;
            println!("{out}");
        }
        Commands::Stream { relay, prompt, system, purpose } => {
            let client = RelayClient::new(relay)?;
            let mut ctl = client.optimize_stream(build_request(prompt, system, purpose), |chunk| {
                if let Some(err) = &chunk.error {
                    eprintln!("\n[error {}: {}]", chunk.status_code.unwrap_or_default(), err);
                } else if chunk.complete {
                    println!();
                } else {
                    print!("{}", chunk.chunk);
                    io::stdout().flush().ok();
                }
            });
            let interrupted = tokio::select! {
                _ = tokio::signal::ctrl_c() => true,
                _ = ctl.wait() => false,
            };
            if interrupted {
                ctl.abort();
                ctl.wait().await;
                eprintln!("\n[aborted]");
            }
        }
    }

    Ok(())
}
