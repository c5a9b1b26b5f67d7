use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "appbox")]
#[command(
    author,
    version,
    about = "Sandboxed execution environments for app-builder sessions"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session the operation applies to
    #[arg(short, long, global = true, default_value = "default")]
    session: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a file into the sandbox (content from --content or stdin)
    Write {
        /// Path inside the sandbox
        path: String,

        /// File content; omit to read from stdin
        #[arg(short, long)]
        content: Option<String>,
    },

    /// Print a sandbox file
    Read {
        /// Path inside the sandbox
        path: String,
    },

    /// List a sandbox directory
    Ls {
        /// Path inside the sandbox
        #[arg(default_value = ".")]
        path: String,
    },

    /// Run a shell command in the sandbox
    Run {
        /// Command to execute
        command: String,

        /// Timeout in seconds (0 = no timeout)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Spawn detached instead of waiting for exit
        #[arg(short, long)]
        background: bool,
    },

    /// Start the dev server and keep it running until Ctrl-C
    Serve {
        /// Project directory inside the sandbox
        #[arg(default_value = ".")]
        project_dir: String,

        /// Port to bind; allocated automatically when omitted
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Tear the session down
    Destroy {
        /// Keep the session's files on disk
        #[arg(long)]
        keep_files: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("appbox=debug")
    } else {
        EnvFilter::new("appbox=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Write { path, content } => {
            commands::write::run(&cli.session, &path, content).await?;
        }
        Commands::Read { path } => {
            commands::read::run(&cli.session, &path).await?;
        }
        Commands::Ls { path } => {
            commands::ls::run(&cli.session, &path).await?;
        }
        Commands::Run {
            command,
            timeout,
            background,
        } => {
            let code = commands::run::run(&cli.session, &command, timeout, background).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Serve { project_dir, port } => {
            commands::serve::run(&cli.session, &project_dir, port).await?;
        }
        Commands::Destroy { keep_files } => {
            commands::destroy::run(&cli.session, keep_files).await?;
        }
    }

    Ok(())
}
