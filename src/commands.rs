//! Operator subcommands.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use crate::app::App;
use crate::queue::OperationKind;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Run the local gateway and background sync until Ctrl-C
  Serve {
    /// Also log to stderr
    #[arg(long)]
    foreground_log: bool,
  },
  /// Drain the write queue once and print the outcome
  Sync,
  /// Show pending and abandoned operations and cache partitions
  Status,
  /// Append an operation to the write queue
  Enqueue {
    /// Operation kind, e.g. create-sale
    #[arg(short, long)]
    kind: OperationKind,
    /// JSON payload
    #[arg(short, long)]
    payload: String,
  },
  /// List abandoned operations, or move one back into the queue
  DeadLetters {
    /// Id of the operation to re-queue
    #[arg(long)]
    retry: Option<String>,
  },
  /// Drop every pending operation (abandoned ones are kept)
  ClearQueue,
  /// Wipe every cache partition
  ClearCache,
}

impl Command {
  /// Whether log lines should also go to stderr.
  pub fn logs_to_stderr(&self) -> bool {
    matches!(
      self,
      Command::Serve {
        foreground_log: true
      }
    )
  }
}

pub async fn run(command: Command, app: App) -> Result<()> {
  match command {
    Command::Serve { .. } => app.serve().await,
    Command::Sync => sync(&app).await,
    Command::Status => status(&app),
    Command::Enqueue { kind, payload } => enqueue(&app, kind, &payload),
    Command::DeadLetters { retry: Some(id) } => {
      let op = app
        .open_queue()?
        .retry_dead_letter(&id)
        .map_err(|e| eyre!("Failed to re-queue {}: {}", id, e))?;
      println!("Re-queued {} ({})", op.id, op.kind);
      Ok(())
    }
    Command::DeadLetters { retry: None } => dead_letters(&app),
    Command::ClearQueue => {
      let dropped = app
        .open_queue()?
        .clear()
        .map_err(|e| eyre!("Failed to clear queue: {}", e))?;
      println!("Dropped {} pending operations", dropped);
      Ok(())
    }
    Command::ClearCache => {
      let removed = app.cache().clear()?;
      println!("Removed {} cached responses", removed);
      Ok(())
    }
  }
}

async fn sync(app: &App) -> Result<()> {
  match app.sync_once().await? {
    Some(report) => {
      let json = serde_json::to_string_pretty(&report)
        .map_err(|e| eyre!("Failed to encode drain report: {}", e))?;
      println!("{}", json);
      if let Some(e) = report.storage_error {
        return Err(eyre!("Queue storage failed during sync: {}", e));
      }
      Ok(())
    }
    None => Err(eyre!("Another drain is already running")),
  }
}

fn status(app: &App) -> Result<()> {
  let queue = app.queue_view()?;
  println!("Backend:      {}", app.config().backend.url);
  println!("Pending:      {}", queue.pending.len());
  println!("Dead letters: {}", queue.dead.len());

  for op in queue.pending {
    let next = op
      .next_attempt_at
      .map(|t| format!(", next attempt {}", t.to_rfc3339()))
      .unwrap_or_default();
    println!(
      "  {}  {:<16} attempts {}{}",
      op.id, op.kind, op.attempts, next
    );
  }

  let partitions = app.cache().partitions()?;
  println!("Cache partitions: {}", partitions.len());
  for partition in partitions {
    println!("  {}", partition);
  }
  Ok(())
}

fn enqueue(app: &App, kind: OperationKind, payload: &str) -> Result<()> {
  let payload: Value =
    serde_json::from_str(payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
  let queue = app.open_queue()?;
  let op = queue
    .enqueue(kind, payload)
    .map_err(|e| eyre!("Failed to enqueue: {}", e))?;
  println!("Queued {} ({} pending)", op.id, queue.count());
  Ok(())
}

fn dead_letters(app: &App) -> Result<()> {
  let dead = app.queue_view()?.dead;
  if dead.is_empty() {
    println!("No abandoned operations");
    return Ok(());
  }

  for entry in dead {
    println!(
      "{}  {:<16} abandoned {} after {} attempts: {}",
      entry.operation.id,
      entry.operation.kind,
      entry.abandoned_at.to_rfc3339(),
      entry.operation.attempts,
      entry.reason
    );
  }
  Ok(())
}
