use std::io::BufRead;
use std::thread;

use tokio::sync::mpsc;
use tracing::warn;

/// Reads stdin line by line on a dedicated thread.
///
/// Tokio's own stdin parks a blocking read that cannot be cancelled, which
/// keeps the runtime from shutting down until the user presses enter. A
/// detached thread does not. The receiver yields `None` at end of input.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = ?err, "failed to spawn stdin reader");
    }
    rx
}
