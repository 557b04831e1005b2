mod commands;

use std::path::PathBuf;

use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "werf", about = "Coordinate werf stage builds across CI jobs")]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short = 'v', global = true, env = "WERF_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the synchronization server shared by concurrent werf invocations
    Synchronization(commands::SynchronizationArgs),
    /// Inspect and manage the stages storage cache
    Stages {
        #[command(subcommand)]
        action: StagesAction,
    },
}

#[derive(Args)]
struct ProjectArgs {
    /// Project directory containing werf.toml
    #[arg(long, default_value = ".", env = "WERF_DIR")]
    dir: PathBuf,
    /// ":local" or http://host:port of a synchronization server (overrides werf.toml)
    #[arg(long, env = "WERF_SYNCHRONIZATION")]
    synchronization: Option<String>,
}

#[derive(Subcommand)]
enum StagesAction {
    /// Print the signature of every stage in werf.toml
    Signatures {
        #[arg(long, default_value = ".", env = "WERF_DIR")]
        dir: PathBuf,
        /// Digest of the base image the first stage builds on
        #[arg(long, default_value = "", env = "WERF_BASE_IMAGE_DIGEST")]
        base_image_digest: String,
    },
    /// Show the canonical image of a signature
    Lookup {
        signature: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Offer an image as the canonical one for a signature
    Publish {
        signature: String,
        image_id: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// List every cached stage of the project
    List {
        /// Print the records as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Drop every cached stage of the project
    Purge {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
        #[command(flatten)]
        project: ProjectArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Synchronization(args) => {
            let sub = matches
                .subcommand_matches("synchronization")
                .unwrap_or(&matches);
            commands::synchronization(args, sub).await?
        }
        Commands::Stages { action } => match action {
            StagesAction::Signatures {
                dir,
                base_image_digest,
            } => commands::stages_signatures(&dir, &base_image_digest)?,
            StagesAction::Lookup { signature, project } => {
                commands::stages_lookup(&project.dir, project.synchronization.as_deref(), &signature)
                    .await?
            }
            StagesAction::Publish {
                signature,
                image_id,
                project,
            } => {
                commands::stages_publish(
                    &project.dir,
                    project.synchronization.as_deref(),
                    &signature,
                    &image_id,
                )
                .await?
            }
            StagesAction::List { json, project } => {
                commands::stages_list(&project.dir, project.synchronization.as_deref(), json)
                    .await?
            }
            StagesAction::Purge { yes, project } => {
                commands::stages_purge(&project.dir, project.synchronization.as_deref(), yes)
                    .await?
            }
        },
    }

    Ok(())
}
