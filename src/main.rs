use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use iac_runner::config::{AppConfig, DEFAULT_CONFIG_PATH};

mod cmd;

#[derive(Parser)]
#[command(name = "iac-runner")]
#[command(version, about = "Run infrastructure-as-code jobs in isolated workspaces")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP job server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Allow any CORS origin (local front-end development)
        #[arg(long)]
        dev: bool,
    },
    /// Create the job database and exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create one job, execute it and print its logs
    Run {
        /// Job name
        #[arg(long)]
        name: String,

        /// Command to run: plan, apply or destroy
        #[arg(long)]
        command: String,

        /// Configuration file to execute
        #[arg(long)]
        file: PathBuf,

        /// Owner recorded on the job
        #[arg(long, default_value = "local")]
        owner: String,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Generate configuration source for a set of resources
    Generate {
        /// Cloud provider: aws, azure or gcp
        #[arg(long)]
        provider: String,

        /// Project name used for resource names and tags
        #[arg(long)]
        project_name: String,

        /// Free-form project description
        #[arg(long)]
        description: Option<String>,

        /// Resource as id:type[:label], repeatable
        #[arg(long = "resource")]
        resources: Vec<String>,
    },
    /// View and manage configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config)?;
    config.apply_env();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    let _log_guard = iac_runner::logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => cmd::cmd_serve(config, port, host, db_path, dev).await?,
        Commands::InitDb { db_path } => cmd::cmd_init_db(config, db_path)?,
        Commands::Run {
            name,
            command,
            file,
            owner,
            db_path,
        } => cmd::cmd_run(config, name, command, file, owner, db_path).await?,
        Commands::Generate {
            provider,
            project_name,
            description,
            resources,
        } => cmd::cmd_generate(&config, provider, project_name, description, &resources).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}
