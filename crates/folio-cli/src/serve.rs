//! Serve command implementation for the folio CLI.
//!
//! Starts an interactive WebSocket server on an empty workbook.

use folio_core::{Isolation, WorkbookConfig};
use folio_server::ServerConfig;

use crate::colors;

/// Start the interactive workbook server.
pub async fn execute(port: Option<u16>, workbook: WorkbookConfig) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env();
    if let Some(port) = port {
        config.port = port;
    }

    println!(
        "\n{}folio Server{} - Interactive Workbook",
        colors::BOLD,
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    let isolation = match workbook.isolation {
        Isolation::Process => "worker process",
        Isolation::InProcess => "in-process",
    };
    println!("{}  ◆ Execution:{} {}", colors::CYAN, colors::RESET, isolation);
    for path in &workbook.package_paths {
        println!("{}  ◆ Packages:{} {}", colors::CYAN, colors::RESET, path.display());
    }
    println!(
        "{}  ◆ Server:{} http://{}:{}",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!(
        "{}  ◆ WebSocket:{} ws://{}:{}/ws",
        colors::CYAN,
        colors::RESET,
        config.host,
        config.port
    );
    println!("{}", "─".repeat(50));
    println!("{}Press Ctrl+C to stop{}", colors::GREEN, colors::RESET);
    println!();

    folio_server::serve(config, workbook).await?;

    Ok(())
}
