//! folio CLI - interactive workbooks from the terminal.

mod colors;
mod run;
mod serve;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use folio_core::WorkbookConfig;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Interactive workbooks for folio script")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Options shared by every command that evaluates cells.
#[derive(Args)]
struct EngineArgs {
    /// Run cells on a host thread instead of a folio-worker process
    #[arg(long)]
    in_process: bool,

    /// Extra package directory, searched before the defaults (repeatable)
    #[arg(long = "package-path", value_name = "DIR")]
    package_paths: Vec<PathBuf>,
}

impl EngineArgs {
    fn config(&self) -> WorkbookConfig {
        let mut config = WorkbookConfig::from_env();
        for path in self.package_paths.iter().rev() {
            config = config.with_package_path(path);
        }
        if self.in_process {
            config = config.in_process();
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate files headlessly, one cell per file, in order
    Run {
        /// Cell source files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print evaluation events as JSON lines
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Start the interactive workbook server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Format engine errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(folio_err) = err.downcast_ref::<folio_core::Error>() {
            anyhow::anyhow!("{}", folio_err.with_hint())
        } else {
            err
        }
    };

    match cli.command {
        Commands::Run {
            files,
            json,
            engine,
        } => {
            let succeeded = run::execute(&files, engine.config(), json)
                .await
                .map_err(format_error)?;
            if !succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Serve { port, engine } => {
            serve::execute(port, engine.config()).await.map_err(format_error)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
