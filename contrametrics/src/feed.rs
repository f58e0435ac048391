// contrametrics/src/feed.rs
//
// JSONL detection feeds — the ingestion side of the daemon.
//
//   tail  — follow a live feed file written by the detection pipeline
//   load  — read a whole captured feed (replay / report mode)
//
// Each line is an EventSubmission. Unparseable lines are logged and skipped;
// validation happens later at Analytics::submit, whose outcome the consumer
// tallies in FeedStats.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::events::EventSubmission;

// ── Consumer tallies ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FeedStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl FeedStats {
    pub fn record<T, E>(&self, outcome: &std::result::Result<T, E>) {
        let counter = if outcome.is_ok() { &self.accepted } else { &self.rejected };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn accepted(&self) -> u64 { self.accepted.load(Ordering::Relaxed) }
    pub fn rejected(&self) -> u64 { self.rejected.load(Ordering::Relaxed) }
}

// ── Readers ───────────────────────────────────────────────────────────────────

fn parse_line(line: &str, n: usize) -> Option<EventSubmission> {
    let line = line.trim();
    if line.is_empty() { return None; }
    match serde_json::from_str::<EventSubmission>(line) {
        Ok(sub) => Some(sub),
        Err(e)  => { warn!("Feed line {} parse error: {}", n, e); None }
    }
}

/// Follow `path`, forwarding every new line. With `seek_end` the existing
/// complete lines are skipped and only lines finished after startup are sent.
///
/// A line is only parsed once its '\n' has arrived; a record the writer has
/// flushed halfway is held and completed on a later read.
pub async fn tail_jsonl(path: PathBuf, tx: mpsc::Sender<EventSubmission>, seek_end: bool) -> Result<()> {
    let file       = tokio::fs::File::open(&path).await?;
    let mut reader = BufReader::new(file);
    let mut buf    = Vec::new();
    let mut n      = 0usize;

    if seek_end {
        while reader.read_until(b'\n', &mut buf).await? > 0 {
            if buf.ends_with(b"\n") {
                n += 1;
                buf.clear();
            }
        }
    }

    info!("Tailing {} from line {}", path.display(), n + 1);
    loop {
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 || !buf.ends_with(b"\n") {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            continue;
        }
        n += 1;
        let sub = parse_line(&String::from_utf8_lossy(&buf), n);
        buf.clear();
        if let Some(sub) = sub {
            if tx.send(sub).await.is_err() { break; }
        }
    }
    Ok(())
}

/// Read a complete feed into memory.
pub async fn load_jsonl(path: &Path) -> Result<Vec<EventSubmission>> {
    let content = tokio::fs::read_to_string(path).await?;
    let subs: Vec<EventSubmission> = content.lines()
        .enumerate()
        .filter_map(|(i, line)| parse_line(line, i + 1))
        .collect();
    info!("Loaded {} submissions from {}", subs.len(), path.display());
    Ok(subs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Analytics, EngineConfig};

    #[tokio::test]
    async fn stats_count_submit_outcomes() {
        let analytics = Analytics::in_memory(EngineConfig::default());
        let stats     = FeedStats::default();
        let good = EventSubmission {
            timestamp:      Some(chrono::Utc::now()),
            source:         Some("politics".into()),
            accuracy_score: Some(0.9),
            ..Default::default()
        };
        let bad = EventSubmission { source: Some("food".into()), ..Default::default() };

        stats.record(&analytics.submit(good.clone()).await);
        stats.record(&analytics.submit(bad).await);
        // Same content, same derived id: rejected as a duplicate.
        stats.record(&analytics.submit(good).await);

        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.rejected(), 2);
    }

    #[tokio::test]
    async fn load_skips_blank_and_garbage_lines() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        std::fs::write(&path, concat!(
            r#"{"timestamp":"2024-01-15T00:00:00Z","category":"Political","source":"politics","accuracyScore":0.9}"#, "\n",
            "\n",
            "{broken\n",
            r#"{"source":"food","accuracyScore":0.4}"#, "\n",
        )).unwrap();

        let subs = load_jsonl(&path).await.unwrap();
        assert_eq!(subs.len(), 2);
        // Second line parses but is missing its timestamp; rejection happens at submit.
        assert!(subs[1].timestamp.is_none());
    }

    #[tokio::test]
    async fn tail_forwards_appended_lines() {
        use std::io::Write;

        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        std::fs::write(&path, "{\"source\":\"old\",\"accuracyScore\":0.1}\n").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(tail_jsonl(path.clone(), tx, true));
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "{{\"source\":\"new\",\"accuracyScore\":0.2}}").unwrap();
        f.flush().unwrap();

        let got = tokio::time::timeout(tokio::time::Duration::from_secs(5), rx.recv())
            .await.unwrap().unwrap();
        assert_eq!(got.source.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn tail_waits_for_the_rest_of_a_split_record() {
        use std::io::Write;

        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.jsonl");
        std::fs::write(&path, "").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(tail_jsonl(path.clone(), tx, true));
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "{{\"source\":\"new\",").unwrap();
        f.flush().unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        writeln!(f, "\"accuracyScore\":0.2}}").unwrap();
        f.flush().unwrap();

        let got = tokio::time::timeout(tokio::time::Duration::from_secs(5), rx.recv())
            .await.unwrap().unwrap();
        assert_eq!(got.source.as_deref(), Some("new"));
        assert_eq!(got.accuracy_score, Some(0.2));
    }
}
