//! Administrative commands typed on stdin.

use std::{
    io::{self, BufRead},
    thread,
};

/// Starts a thread feeding stdin lines into the returned channel. The tick
/// loop drains it without blocking.
pub fn spawn() -> io::Result<flume::Receiver<String>> {
    let (lines_tx, lines_rx) = flume::unbounded();
    thread::Builder::new()
        .name("aquarelay-console".to_owned())
        .spawn(move || pump(io::stdin().lock(), &lines_tx))?;
    Ok(lines_rx)
}

/// Forwards lines until the reader ends or the receiver is gone.
fn pump(reader: impl BufRead, lines: &flume::Sender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if lines.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read console input: {e}");
                break;
            }
        }
    }
    tracing::debug!("Console input closed");
}
