//! `circular`: operator CLI over the signing ledger.
//!
//! Read-only: progress per campaign, rows waiting for a retry sweep, and
//! integrity checks of document files against the hash on record. Collaborator
//! services are deployment-specific, so the roster is passed in as a JSON file
//! of child ids where a command needs it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

use circular_core::ids::{CampaignId, ChildId, ResponseId};
use circular_core::response::CampaignStats;
use circular_engine::integrity;
use circular_settings::{get_settings, init_settings, load_settings_from_path, CircularSettings};
use circular_store::{CampaignRepo, Database, ResponseLedger};
use circular_telemetry::{init_telemetry, LogQuery, TelemetryConfig};

#[derive(Parser)]
#[command(name = "circular")]
#[command(about = "Inspect and audit the circular signing ledger")]
struct Cli {
    /// Settings file (defaults to $CIRCULAR_SETTINGS or ~/.circular/settings.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Signed, errored and pending counts for a campaign
    Stats {
        campaign: String,
        /// JSON array of eligible child ids; without it only ledger counts are shown
        #[arg(long)]
        roster: Option<PathBuf>,
    },
    /// Eligible children with no live response
    Pending {
        campaign: String,
        #[arg(long)]
        roster: PathBuf,
    },
    /// Live responses of a campaign
    Live { campaign: String },
    /// List rows in an error state or stalled longer than the cutoff
    RetrySweep {
        /// Defaults to engine.retry_min_age_secs
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Check a document file against the hash recorded for a response
    VerifyFile { response: String, path: PathBuf },
    /// Persisted warnings and errors, newest first
    Logs {
        #[arg(long)]
        response: Option<String>,
        #[arg(long)]
        campaign: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        let loaded =
            load_settings_from_path(path).with_context(|| format!("loading {}", path.display()))?;
        if init_settings(loaded).is_err() {
            bail!("settings were already initialized");
        }
    }
    let settings = get_settings();
    settings.validate().context("invalid settings")?;

    let telemetry = init_telemetry(telemetry_config(settings));
    let db = Database::open(Path::new(&settings.database.path)).context("opening ledger")?;
    let campaigns = CampaignRepo::new(db.clone());
    let ledger = ResponseLedger::new(db);

    match cli.command {
        Command::Stats { campaign, roster } => {
            let campaign_id = CampaignId::from_raw(campaign);
            let campaign = campaigns.get(&campaign_id)?;
            let counts = ledger.live_counts(&campaign_id)?;
            let output = match roster {
                Some(path) => {
                    let total = load_roster(&path)?.len() as u64;
                    serde_json::to_value(CampaignStats::new(total, counts.signed, counts.errored))?
                }
                None => serde_json::to_value(counts)?,
            };
            print_json(&serde_json::json!({
                "campaign": campaign.id,
                "title": campaign.title,
                "state": campaign.state,
                "stats": output,
            }))?;
        }
        Command::Pending { campaign, roster } => {
            let campaign_id = CampaignId::from_raw(campaign);
            campaigns.get(&campaign_id)?;
            let answered: HashSet<ChildId> =
                ledger.list_live(&campaign_id)?.into_iter().map(|r| r.child_id).collect();
            let pending: Vec<ChildId> = load_roster(&roster)?
                .into_iter()
                .filter(|c| !answered.contains(c))
                .collect();
            print_json(&pending)?;
        }
        Command::Live { campaign } => {
            let rows: Vec<_> = ledger
                .list_live(&CampaignId::from_raw(campaign))?
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "child": r.child_id,
                        "version": r.version,
                        "state": r.state,
                        "content_hash": r.document.content_hash,
                        "location": r.document.location,
                        "error": r.error_detail,
                    })
                })
                .collect();
            print_json(&rows)?;
        }
        Command::RetrySweep { older_than_secs } => {
            let secs = older_than_secs.unwrap_or(settings.engine.retry_min_age_secs);
            let cutoff = Utc::now() - chrono::Duration::seconds(secs as i64);
            let rows: Vec<_> = ledger
                .list_retry_candidates(cutoff)?
                .into_iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "campaign": r.campaign_id,
                        "child": r.child_id,
                        "version": r.version,
                        "state": r.state,
                        "updated_at": r.updated_at,
                        "error": r.error_detail,
                    })
                })
                .collect();
            info!(count = rows.len(), older_than_secs = secs, "retry candidates listed");
            print_json(&rows)?;
        }
        Command::VerifyFile { response, path } => {
            let response = ledger.get(&ResponseId::from_raw(response))?;
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            match integrity::check_artifact(&response, &bytes) {
                Ok(sha256) => println!("ok {sha256}"),
                Err(e) => bail!("{} does not match response {}: {e}", path.display(), response.id),
            }
        }
        Command::Logs {
            response,
            campaign,
            limit,
        } => {
            let Some(sink) = telemetry.logs() else {
                bail!("telemetry.log_to_sqlite is disabled");
            };
            let records = sink.query(&LogQuery {
                response_id: response,
                campaign_id: campaign,
                limit: Some(limit),
            })?;
            print_json(&records)?;
        }
    }

    Ok(())
}

fn telemetry_config(settings: &CircularSettings) -> TelemetryConfig {
    let mut config = TelemetryConfig::default().with_level_str(&settings.telemetry.log_level);
    config.log_to_sqlite = settings.telemetry.log_to_sqlite;
    config.log_db_path = PathBuf::from(&settings.telemetry.log_db_path);
    config
}

fn load_roster(path: &Path) -> Result<Vec<ChildId>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading roster {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("roster {} is not a JSON array of ids", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
