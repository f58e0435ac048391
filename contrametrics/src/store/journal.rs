// contrametrics/src/store/journal.rs
//
// Append-only JSONL journal — the durability step behind EventStore::append.
//
// One DetectionEvent per line. A write is acknowledged only after the line is
// flushed and fsync'd (sync_data). On open the whole file is replayed; lines
// that fail to parse or validate are logged and skipped, never fatal.
//
// Every acknowledged line ends in '\n'. A trailing fragment without one is a
// write that was never acknowledged (crash or failed append), so it is cut off
// before new lines are appended behind it.

use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::events::DetectionEvent;

struct Tail {
    file: File,
    len:  u64,   // bytes covered by complete, acknowledged lines
}

pub struct Journal {
    tail: Mutex<Tail>,
}

impl Journal {
    /// Open (creating if needed) and return the journal plus every valid event already in it.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<(Self, Vec<DetectionEvent>)> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(b)  => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        let complete = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        let existing = replay(&bytes[..complete]);

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        if complete < bytes.len() {
            warn!(
                dropped = bytes.len() - complete,
                "Journal {} ends in a torn write; truncating to the last complete line",
                path.display()
            );
            file.set_len(complete as u64).await?;
            file.sync_data().await?;
        }

        info!(events = existing.len(), "Journal opened at {}", path.display());
        let tail = Tail { file, len: complete as u64 };
        Ok((Self { tail: Mutex::new(tail) }, existing))
    }

    pub async fn append(&self, event: &DetectionEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut tail = self.tail.lock().await;
        if let Err(e) = write_line(&mut tail.file, &line).await {
            // Drop whatever part of the line reached the file.
            if let Err(t) = tail.file.set_len(tail.len).await {
                warn!("Journal truncate after failed append also failed: {}", t);
            }
            return Err(e);
        }
        tail.len += line.len() as u64;
        Ok(())
    }
}

async fn write_line(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}

fn replay(bytes: &[u8]) -> Vec<DetectionEvent> {
    let mut out = Vec::new();
    for (i, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) { continue; }
        match serde_json::from_slice::<DetectionEvent>(line) {
            Ok(ev) => match ev.validate() {
                Ok(())  => out.push(ev),
                Err(e)  => warn!("Journal line {} rejected: {}", i + 1, e),
            },
            Err(e) => warn!("Journal line {} unparseable: {}", i + 1, e),
        }
    }
    out
}
