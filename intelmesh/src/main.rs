// intelmesh/src/main.rs
//
// intelmesh — federated threat-intelligence exchange coordinator
//
// Two operational modes:
//   serve   — event channel + HTTP API + background sweeps (production)
//   replay  — replay a captured JSONL submission log at scaled speed
//             through the full pipeline (testing/research)
//
// Usage:
//   intelmesh --mode serve --event-addr 0.0.0.0:7600 --http-addr 0.0.0.0:7601
//   intelmesh --mode replay --path captured_reports.jsonl --speed 10.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use intelmesh::config::Config;
use intelmesh::coordinator::Coordinator;
use intelmesh::events::IocPayload;
use intelmesh::fabric::EventServer;
use intelmesh::http_api;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "intelmesh",
    about   = "Federated threat-intelligence exchange coordinator",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, value_enum, default_value = "serve")]
    mode: Mode,

    #[arg(long, default_value = "0.0.0.0:7600", help = "Event channel bind address")]
    event_addr: SocketAddr,

    #[arg(long, default_value = "0.0.0.0:7601", help = "HTTP API bind address")]
    http_addr: SocketAddr,

    #[arg(long, default_value = "./intelmesh_data", help = "Store + audit log directory")]
    data_dir: PathBuf,

    #[arg(long, help = "JSON config file; unset fields keep defaults")]
    config: Option<PathBuf>,

    #[arg(long, default_value = "/tmp/intelmesh_reports.jsonl",
          help = "JSONL submission log (replay mode)")]
    path: PathBuf,

    #[arg(long, default_value = "1.0", help = "Replay speed multiplier")]
    speed: f64,
}

#[derive(Clone, ValueEnum)]
enum Mode {
    Serve,   // live coordinator
    Replay,  // replay a static JSONL submission log at scaled speed
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  ┌─────────────────────────────────────────────┐");
    println!("  │  i n t e l m e s h                          │");
    println!("  │  federated threat-intelligence exchange     │");
    println!("  └─────────────────────────────────────────────┘");
    println!("\x1b[0m");
}

async fn print_stats_loop(coordinator: Arc<Coordinator>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let s = coordinator.status();
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  clients={}/{}  iocs={}  verified={}  avg_trust={:.3} ──\x1b[0m",
            start.elapsed().as_secs_f64(),
            s.online_clients, s.total_clients,
            s.total_iocs, s.verified_iocs, s.average_trust,
        );
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("intelmesh=info".parse()?))
        .compact().init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None       => Config::default(),
    };

    let (coordinator, outcomes) = Coordinator::new(cfg, &cli.data_dir)?;
    coordinator.spawn_background(outcomes);

    print_banner();

    match cli.mode {
        Mode::Serve => {
            println!("  Event channel: \x1b[96m{}\x1b[0m", cli.event_addr);
            println!("  HTTP API     : \x1b[96m{}\x1b[0m", cli.http_addr);
            println!("  Data dir     : \x1b[90m{}\x1b[0m\n", cli.data_dir.display());

            tokio::spawn(print_stats_loop(Arc::clone(&coordinator), Instant::now()));

            let event_server = EventServer::new(Arc::clone(&coordinator), cli.event_addr);
            tokio::spawn(async move {
                if let Err(e) = event_server.serve().await {
                    error!("event channel server failed: {e}");
                }
            });

            let http = Arc::clone(&coordinator);
            let http_addr = cli.http_addr;
            tokio::spawn(async move {
                if let Err(e) = http_api::serve(http, http_addr).await {
                    error!("http api failed: {e}");
                }
            });

            println!("  Press Ctrl+C to stop.\n");
            tokio::signal::ctrl_c().await?;
            info!("shutting down, flushing store");
            coordinator.store.flush()?;
        }

        Mode::Replay => {
            println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}  speed={:.1}x\n",
                     cli.path.display(), cli.speed);
            replay_jsonl(&coordinator, &cli.path, cli.speed).await?;
            coordinator.store.flush()?;
            let s = coordinator.status();
            println!(
                "\n\x1b[1m── replay done  iocs={}  verified={}  clients={} ──\x1b[0m",
                s.total_iocs, s.verified_iocs, s.total_clients,
            );
        }
    }

    Ok(())
}

// ── Replay source ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    at:        DateTime<Utc>,
    client_id: String,
    ioc:       IocPayload,
}

async fn replay_jsonl(coordinator: &Arc<Coordinator>, path: &PathBuf, speed: f64) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut records: Vec<ReplayRecord> = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() { continue; }
        match serde_json::from_str::<ReplayRecord>(line) {
            Ok(r)  => records.push(r),
            Err(e) => warn!("Parse error: {e}"),
        }
    }
    if records.is_empty() { return Ok(()); }
    records.sort_by_key(|r| r.at);

    let base_ts   = records[0].at.timestamp_millis() as f64;
    let base_wall = Instant::now();

    for record in records {
        let offset = (record.at.timestamp_millis() as f64 - base_ts) / speed / 1000.0;
        let target = base_wall + std::time::Duration::from_secs_f64(offset.max(0.0));
        let now    = Instant::now();
        if target > now {
            tokio::time::sleep(target - now).await;
        }

        match coordinator.handle_report(&record.client_id, record.ioc).await {
            Ok(result) if result.newly_verified => {
                println!(
                    "\x1b[92m✔ VERIFIED\x1b[0m {}  reporter={}",
                    result.ioc_id, record.client_id
                );
            }
            Ok(_) => {}
            Err(e) => warn!(client = %record.client_id, error = %e, "replayed submission rejected"),
        }
    }
    Ok(())
}
