//! deskrail-worker — runs one uploaded ticket batch end to end.
//!
//! Reads tickets from a JSON-lines file and the agent/office roster from a
//! JSON file, drives the enrichment-and-routing pipeline, streams stage
//! events to the log, and prints the batch report when the batch drains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use deskrail_bus::EventBus;
use deskrail_core::{config, Agent, Batch, BatchStatus, Config, GeoPoint, Office, Policies, Ticket};
use deskrail_geo::HttpGeocodeProvider;
use deskrail_llm::providers::create_provider;
use deskrail_llm::{AnalysisGenerator, LlmSpamClassifier};
use deskrail_pipeline::orchestrator::Ports;
use deskrail_pipeline::{BatchInput, MemoryProgressStore, Orchestrator, PipelineService};
use deskrail_routing::LoadLedger;
use deskrail_vault::{Cipher, MemoryBindingStore, RegexDetector, Vault};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run one ticket batch through the enrichment-and-routing pipeline.
#[derive(Parser, Debug)]
#[command(name = "deskrail-worker", version, about)]
struct Cli {
    /// JSON-lines ticket file, one upload row per line.
    #[arg(long, env = "DESKRAIL_TICKETS")]
    tickets: String,

    /// Roster JSON file: {"agents": [...], "offices": [...]}.
    #[arg(long, env = "DESKRAIL_ROSTER")]
    roster: String,

    /// Filename label recorded on the batch.
    #[arg(long, default_value = "upload.jsonl")]
    filename: String,
}

// ── Input shapes ────────────────────────────────────────────────────

/// One upload row. Identity and row index are assigned at ingest.
#[derive(Debug, Deserialize)]
struct TicketRow {
    description: String,
    #[serde(default)]
    age: Option<u8>,
    #[serde(default)]
    birth_date: Option<chrono::NaiveDate>,
    #[serde(default)]
    gender: Option<String>,
    segment: deskrail_core::Segment,
    #[serde(default)]
    address: deskrail_core::Address,
    #[serde(default)]
    attachments: Vec<String>,
    #[serde(default)]
    repeat_count: u32,
}

#[derive(Debug, Deserialize)]
struct Roster {
    agents: Vec<Agent>,
    offices: Vec<Office>,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("loading configuration")?;
    config.log_summary();

    let policies = match &config.policy_file {
        Some(path) => Policies::from_yaml_file(path).context("loading policy file")?,
        None => Policies::default(),
    };

    // Ports.
    let cipher = Cipher::from_base64_key(&config.vault.encryption_key)
        .context("building vault cipher")?;
    let vault = Arc::new(Vault::new(
        Box::new(RegexDetector::new()),
        Arc::new(MemoryBindingStore::new()),
        cipher,
    ));
    let analyzer =
        Arc::new(AnalysisGenerator::from_config(&config.llm).context("building LLM provider")?);
    let spam_classifier = Arc::new(LlmSpamClassifier::new(
        create_provider(&config.llm).context("building spam classifier provider")?,
    ));
    let geocoder = Arc::new(HttpGeocodeProvider::new(
        config.geocode.base_url.clone(),
        config.geocode.api_key.clone(),
    ));
    let last_resort = GeoPoint {
        lat: config.geocode.last_resort_lat,
        lon: config.geocode.last_resort_lon,
    };

    // Core.
    let bus = Arc::new(EventBus::new());
    let store = Arc::new(MemoryProgressStore::new());
    let ledger = Arc::new(LoadLedger::new());
    let orchestrator = Arc::new(Orchestrator::new(
        bus.clone(),
        store,
        Ports {
            vault,
            analyzer,
            spam_classifier,
            geocoder,
        },
        last_resort,
        ledger,
        Arc::new(policies),
    ));
    let service = PipelineService::new(orchestrator);

    // Stream every stage event to the log as JSON.
    let mut events = bus.subscribe().context("subscribing to event bus")?;
    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!(target: "deskrail::events", "{line}"),
                Err(e) => tracing::warn!("failed to serialize event: {e}"),
            }
        }
    });

    // Load inputs.
    let input = load_batch(&cli).context("loading batch input")?;
    let total = input.tickets.len();
    info!(file = %cli.tickets, total, "batch loaded");

    let batch_id = service
        .start(input)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    // Poll until the batch reaches a terminal state; Ctrl+C cancels.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, cancelling batch");
                service.cancel(batch_id).await;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }

        let Some(progress) = service.progress(batch_id).await else {
            anyhow::bail!("batch {batch_id} vanished");
        };
        match progress.status {
            BatchStatus::Pending | BatchStatus::InProgress => continue,
            _ => {
                println!("{}", serde_json::to_string_pretty(&progress)?);
                break;
            }
        }
    }

    bus.close();
    event_task.await.ok();
    Ok(())
}

fn load_batch(cli: &Cli) -> anyhow::Result<BatchInput> {
    let roster_raw = std::fs::read_to_string(&cli.roster)
        .with_context(|| format!("reading {}", cli.roster))?;
    let roster: Roster = serde_json::from_str(&roster_raw).context("parsing roster")?;

    let tickets_raw = std::fs::read_to_string(&cli.tickets)
        .with_context(|| format!("reading {}", cli.tickets))?;

    let mut rows = Vec::new();
    for (index, line) in tickets_raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: TicketRow = serde_json::from_str(line)
            .with_context(|| format!("parsing ticket line {}", index + 1))?;
        rows.push(row);
    }

    let batch = Batch::new(cli.filename.clone(), rows.len() as u32);
    let tickets: Vec<Ticket> = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| Ticket {
            id: uuid::Uuid::new_v4(),
            batch_id: batch.id,
            row_index: index as u32,
            description: row.description,
            age: row.age,
            birth_date: row.birth_date,
            gender: row.gender,
            segment: row.segment,
            address: row.address,
            attachments: row.attachments,
            repeat_count: row.repeat_count,
        })
        .collect();

    Ok(BatchInput {
        batch,
        tickets,
        agents: roster.agents,
        offices: roster.offices,
    })
}
