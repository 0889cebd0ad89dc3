//! Run command implementation for the folio CLI.
//!
//! Evaluates a list of files headlessly, each file being one cell.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use folio_core::{
    CellId, EvaluationEvent, EvaluationService, EvaluationStatus, OutputStream, WorkbookConfig,
    WorkbookDirs,
};

use crate::colors;

/// Evaluate `files` in order. Returns whether every cell succeeded.
pub async fn execute(files: &[PathBuf], config: WorkbookConfig, json: bool) -> anyhow::Result<bool> {
    let start = Instant::now();

    let mut sources = Vec::with_capacity(files.len());
    for file in files {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        sources.push((display_name(file), text));
    }

    let config = match workbook_root(files) {
        Some(root) => match WorkbookDirs::from_root(&root) {
            Ok(dirs) => config.with_dirs(&dirs),
            Err(e) => {
                tracing::warn!("Resolution cache disabled: {}", e);
                config
            }
        },
        None => config,
    };

    let service = EvaluationService::from_config(&config);
    let mut names = HashMap::new();
    let mut last = None;
    for (name, text) in sources {
        let id = service.insert_cell(text, None, false)?;
        names.insert(id, name);
        last = Some(id);
    }
    let Some(target) = last else {
        return Ok(true);
    };

    if !json {
        println!(
            "\n{}Running{} {} cell(s)",
            colors::BOLD,
            colors::RESET,
            names.len()
        );
        println!("{}", "─".repeat(50));
    }

    let interrupt = spawn_interrupt_handler(Arc::clone(&service));
    let mut stream = service.evaluate(target, true)?;
    while let Some(event) = stream.next_event().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event, &names);
        }
    }
    let summary = stream.summary().await;
    interrupt.abort();
    service.shutdown().await;

    let succeeded = summary.all_succeeded() && summary.finished.len() == names.len();
    if !json {
        println!("{}", "─".repeat(50));
        if succeeded {
            println!(
                "{}Completed{} {} cell(s) in {:.2}s",
                colors::GREEN,
                colors::RESET,
                summary.finished.len(),
                start.elapsed().as_secs_f64()
            );
        } else if summary.context_lost {
            println!(
                "{}Execution context lost{} after {} cell(s)",
                colors::RED,
                colors::RESET,
                summary.finished.len()
            );
        } else if summary.aborted {
            println!("{}Aborted{}", colors::YELLOW, colors::RESET);
        } else {
            println!(
                "{}Failed{} after {} of {} cell(s)",
                colors::RED,
                colors::RESET,
                summary.finished.len(),
                names.len()
            );
        }
    }

    Ok(succeeded)
}

/// Abort the run on Ctrl+C.
fn spawn_interrupt_handler(service: Arc<EvaluationService>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && service.abort() {
            eprintln!("{}Interrupted; aborting{}", colors::YELLOW, colors::RESET);
        }
    })
}

fn print_event(event: &EvaluationEvent, names: &HashMap<CellId, String>) {
    let name = names.get(&event.cell()).map(String::as_str).unwrap_or("?");
    match event {
        EvaluationEvent::Started { .. } => {
            println!("{}▶ {}{}", colors::CYAN, name, colors::RESET);
        }
        EvaluationEvent::CapturedOutput { stream, text, .. } => match stream {
            OutputStream::Stdout => print!("{}", text),
            OutputStream::Stderr => eprint!("{}", text),
        },
        EvaluationEvent::Result { value, .. } => {
            println!(
                "{}={} {} {}: {}{}",
                colors::GREEN,
                colors::RESET,
                value.text,
                colors::DIM,
                value.type_name,
                colors::RESET
            );
        }
        EvaluationEvent::Finished {
            status,
            diagnostics,
            duration_ms,
            ..
        } => {
            let (mark, color) = match status {
                EvaluationStatus::Success => ("✓", colors::GREEN),
                EvaluationStatus::Error => ("✗", colors::RED),
                EvaluationStatus::Aborted => ("■", colors::YELLOW),
            };
            println!(
                "{}{}{} {} {}({} ms){}",
                color,
                mark,
                colors::RESET,
                name,
                colors::DIM,
                duration_ms,
                colors::RESET
            );
            for diagnostic in diagnostics {
                eprintln!("    {}{}{}", color, diagnostic, colors::RESET);
            }
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Directory holding the workbook's `.folio` cache: that of the first file.
fn workbook_root(files: &[PathBuf]) -> Option<PathBuf> {
    let parent = files.first()?.parent()?;
    if parent.as_os_str().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(parent.to_path_buf())
    }
}
