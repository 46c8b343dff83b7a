mod cli;
mod commands;
mod error;
mod pipeline;
mod run_artifacts;
mod run_context;
mod video;
mod web;

use anyhow::Result;
use cli::{Args, Command};
use web::server::{run_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    if let Command::Serve {
        host,
        port,
        output_dir,
    } = &args.command
    {
        let ensemble = match args.ensemble_config() {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Jobs disabled: {:#}", e);
                None
            }
        };
        let state = AppState {
            output_dir: output_dir.clone(),
            ensemble,
        };
        return run_server(*host, *port, state).await;
    }

    // Inference is blocking; keep it off the async workers.
    tokio::task::spawn_blocking(move || run_command(&args)).await?
}

fn run_command(args: &Args) -> Result<()> {
    match &args.command {
        Command::Image { input, output } => commands::image(args, input, output.clone()),
        Command::Video {
            input,
            output,
            events,
        } => commands::video(args, input, output.clone(), events.clone()),
        Command::Batch {
            paths,
            output_dir,
            preview,
        } => commands::batch(args, paths, output_dir, *preview),
        Command::History { output_dir } => commands::history(output_dir),
        Command::Serve { .. } => unreachable!("handled in main"),
    }
}
