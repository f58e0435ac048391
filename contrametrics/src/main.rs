// contrametrics/src/main.rs
//
// contrametrics — windowed metrics engine behind the contradiction dashboard
//
// Three operational modes:
//   serve   — tail a JSONL detection feed and answer dashboard queries over TCP
//   replay  — ingest a captured feed and print every dashboard shape as JSON
//   query   — answer one request against the journal and exit
//
// Usage:
//   contrametrics --mode serve  --journal /var/lib/contrametrics/events.jsonl --path /var/log/detections.jsonl
//   contrametrics --mode replay --path captured.jsonl --period 1y
//   contrametrics --mode query  --journal events.jsonl --query leaderboard --period 30d --top-n 5

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use contrametrics::engine::{Period, QueryRequest};
use contrametrics::events::EventSubmission;
use contrametrics::server::QueryServer;
use contrametrics::feed::FeedStats;
use contrametrics::{feed, Analytics, EngineConfig};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "contrametrics",
    about   = "Windowed metrics aggregation for contradiction detection",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "serve")]
    mode: Mode,

    #[arg(long, help = "JSON engine config; flags below override it")]
    config: Option<PathBuf>,

    #[arg(long, help = "Event journal (JSONL). In-memory when omitted")]
    journal: Option<PathBuf>,

    #[arg(long, help = "Detection feed JSONL (serve/replay modes)")]
    path: Option<PathBuf>,

    #[arg(long, help = "Query API bind address (serve mode)")]
    bind: Option<SocketAddr>,

    #[arg(long, help = "Days of hour-resolution buckets to retain")]
    retention_days: Option<i64>,

    #[arg(long, default_value_t = false, help = "Ingest the existing feed before tailing")]
    from_start: bool,

    #[arg(long, default_value = "30d", help = "7d | 30d | 90d | 1y")]
    period: String,

    #[arg(long, default_value = "trend", help = "trend | categories | leaderboard | live")]
    query: String,

    #[arg(long)]
    top_n: Option<i64>,

    #[arg(long, help = "Anchor instant for replay/query (RFC 3339); defaults to now")]
    anchor: Option<DateTime<Utc>>,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Serve,   // tail a live feed + query API
    Replay,  // ingest a captured feed, print the dashboard
    Query,   // one-shot query against the journal
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut cfg = match self.config {
            Some(ref p) => EngineConfig::load(p)?,
            None        => EngineConfig::default(),
        };
        if let Some(ref j) = self.journal      { cfg.journal_path = Some(j.clone()); }
        if let Some(b) = self.bind             { cfg.bind = b; }
        if let Some(d) = self.retention_days   { cfg.hour_retention_days = d; }
        cfg.checked()
    }
}

// ── Modes ─────────────────────────────────────────────────────────────────────

async fn run_serve(cli: &Cli, analytics: Arc<Analytics>, bind: SocketAddr) -> Result<()> {
    let start = Instant::now();
    let stats = Arc::new(FeedStats::default());

    tokio::spawn(Arc::clone(&analytics).housekeeping_loop());
    tokio::spawn(stats_loop(Arc::clone(&analytics), Arc::clone(&stats), start));

    let server = QueryServer::bind(Arc::clone(&analytics), bind).await?;
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            warn!("Query API stopped: {}", e);
        }
    });

    let Some(path) = cli.path.clone() else {
        info!("No feed configured; accepting appends over the query API only");
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    let (tx, mut rx) = mpsc::channel::<EventSubmission>(16384);
    let seek_end = !cli.from_start;
    tokio::spawn(async move {
        if let Err(e) = feed::tail_jsonl(path, tx, seek_end).await {
            warn!("Feed tail stopped: {}", e);
        }
    });

    // Sequential consumer: each submission is durable before the next is read.
    loop {
        tokio::select! {
            sub = rx.recv() => match sub {
                Some(sub) => stats.record(&analytics.submit(sub).await),
                None      => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn run_replay(cli: &Cli, analytics: &Analytics) -> Result<()> {
    let path = cli.path.clone()
        .ok_or_else(|| anyhow::anyhow!("--path is required in replay mode"))?;
    let period: Period = cli.period.parse()?;

    let stats = FeedStats::default();
    let mut latest: Option<DateTime<Utc>> = None;
    for sub in feed::load_jsonl(&path).await? {
        let outcome = analytics.submit(sub).await;
        if let Ok(ref ev) = outcome {
            latest = latest.max(Some(ev.timestamp));
        }
        stats.record(&outcome);
    }
    info!(accepted = stats.accepted(), rejected = stats.rejected(), "Replay ingested");

    // Historical feeds read best anchored at their own last event.
    let anchor = cli.anchor.or(latest).unwrap_or_else(Utc::now);
    let report: serde_json::Map<String, serde_json::Value> = analytics
        .dashboard_at(period, anchor)
        .into_iter()
        .map(|(kind, result)| -> Result<(String, serde_json::Value)> {
            Ok((kind.token().to_string(), serde_json::to_value(result)?))
        })
        .collect::<Result<_>>()?;

    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "period":  period.token(),
        "anchor":  anchor,
        "results": report,
    }))?);
    Ok(())
}

fn run_query(cli: &Cli, analytics: &Analytics) -> Result<()> {
    let req = QueryRequest { period: cli.period.clone(), query: cli.query.clone(), top_n: cli.top_n };
    let anchor = cli.anchor.unwrap_or_else(Utc::now);
    let result = analytics.query_at(&req, anchor)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn stats_loop(analytics: Arc<Analytics>, feed: Arc<FeedStats>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let t       = analytics.index.totals();
        info!(
            uptime_s   = elapsed as u64,
            detections = t.detections,
            users      = t.users,
            accepted   = feed.accepted(),
            rejected   = feed.rejected(),
            eps        = %format!("{:.1}", t.detections as f64 / elapsed.max(1.0)),
            "stats"
        );
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("contrametrics=info".parse()?))
        .compact().init();

    let cli       = Cli::parse();
    let config    = cli.engine_config()?;
    let bind      = config.bind;
    let analytics = Arc::new(Analytics::open(config).await?);

    info!(
        events  = analytics.store.len(),
        durable = analytics.store.is_durable(),
        "Engine ready"
    );

    match cli.mode {
        Mode::Serve  => run_serve(&cli, analytics, bind).await,
        Mode::Replay => run_replay(&cli, &analytics).await,
        Mode::Query  => run_query(&cli, &analytics),
    }
}
