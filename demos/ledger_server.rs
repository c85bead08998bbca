//! A small simulated server: two datasets, one scheduler, periodic updates,
//! and a clean shutdown flush.
//!
//! Run with `cargo run --example ledger_server -- /tmp/ledger-demo`.

use anyhow::Result;
use datakeep::{
    DatasetHooks, LoadOutcome, MigrationPlan, MsgPackCodec, PersistentDataset, SaveScheduler,
    SchedulerPolicy, VersionedJsonCodec,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Ledger {
    accounts: BTreeMap<String, i64>,
    currency: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Plots {
    owners: BTreeMap<u32, String>,
}

fn ledger_codec() -> Result<VersionedJsonCodec<Ledger>> {
    // v0 files were a bare name -> balance map; v1 added the currency.
    let plan = MigrationPlan::new(1).with_step(0, 1, |legacy| {
        Ok(json!({ "accounts": legacy, "currency": "coins" }))
    })?;
    Ok(VersionedJsonCodec::with_plan(plan)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("datakeep-ledger-demo"));

    let ledger = Arc::new(
        PersistentDataset::new("ledger", data_dir.join("ledger.json"), ledger_codec()?)
            .with_priority(0)
            .with_hooks(
                DatasetHooks::new()
                    .on_no_file_found(|ledger: &mut Ledger| {
                        ledger.currency = "coins".to_string();
                        ledger.accounts.insert("bank".to_string(), 1_000_000);
                    })
                    .details(|ledger: &Ledger| format!("{} accounts", ledger.accounts.len())),
            ),
    );
    let plots = Arc::new(
        PersistentDataset::new("plots", data_dir.join("plots.bin"), MsgPackCodec::<Plots>::new())
            .with_priority(5)
            .with_hooks(
                DatasetHooks::new()
                    .details(|plots: &Plots| format!("{} claimed plots", plots.owners.len())),
            ),
    );

    for (name, outcome) in [("ledger", ledger.load().await?), ("plots", plots.load().await?)] {
        if outcome != LoadOutcome::NoFile {
            println!("{}: {:?}", name, outcome);
        }
    }

    let scheduler = Arc::new(SaveScheduler::new(SchedulerPolicy {
        interval_ms: 250,
        batch_size: 1,
    }));
    scheduler.register(ledger.clone())?;
    scheduler.register(plots.clone())?;
    scheduler.start()?;

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    for round in 0..20u32 {
        ticker.tick().await;
        ledger.update(|ledger| {
            *ledger.accounts.entry(format!("player-{}", round % 4)).or_insert(0) += 10;
        })?;
        if round % 3 == 0 {
            plots.update(|plots| {
                plots.owners.insert(round, format!("player-{}", round % 4));
            })?;
        }
    }

    scheduler.stop().await?;
    let flushed = scheduler.save_all().await?;
    println!("Shutdown flush saved {} dataset(s)", flushed.saved);

    let report = scheduler.health_report().await?;
    println!("{}", report.summary());
    for dataset in &report.datasets {
        println!("  {}", dataset);
    }
    Ok(())
}
