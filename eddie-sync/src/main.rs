use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use eddie_sync_lib::adapters::sqlite::{account_state, SyncDatabase};
use eddie_sync_lib::config::{load_config_or_default, AccountConfig, AppConfig};
use eddie_sync_lib::services::{logger, Pop3Account, SyncSummary};
use eddie_sync_lib::sync::{EngineSettings, SyncEngine};
use eddie_sync_lib::types::error::EddieError;

/// `eddie-sync [--grow] [config.toml]`
#[tokio::main]
async fn main() {
    logger::init();
    eddie_sync_lib::install_crypto_provider();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EddieError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let grow = args.iter().any(|a| a == "--grow");
    let config_path = args.iter().find(|a| !a.starts_with("--")).map(PathBuf::from);

    let config = load_config_or_default(config_path.as_deref())?;
    info!("Starting eddie-sync with {} accounts", config.accounts.len());

    let engine = SyncEngine::start(EngineSettings::from(&config.sync));

    for (account_id, account_config) in &config.accounts {
        if !account_config.enabled {
            info!(account_id = %account_id, "Account disabled, skipping");
            continue;
        }
        match sync_account(&engine, &config, account_id, account_config, grow).await {
            Ok(summary) => println!("{}: {}", account_id, serde_json::to_string(&summary)?),
            Err(e) => error!(account_id = %account_id, "Sync failed: {}", e),
        }
    }

    engine.shutdown().await
}

async fn sync_account(
    engine: &SyncEngine,
    config: &AppConfig,
    account_id: &str,
    account_config: &AccountConfig,
    grow: bool,
) -> Result<SyncSummary, EddieError> {
    let password = account_config.password.resolve().await?;
    let db = SyncDatabase::open(&account_config.database_path(account_id)?)?;
    let state = account_state::load_account_state(db.pool(), account_id)?;

    let account = Arc::new(Pop3Account::new(
        account_id,
        account_config.pop3_options(password, &config.pop3),
        config.pop3.clone(),
        db,
        true,
    )?);
    engine.load_account(account.clone(), state).await?;

    // Let restored mutations run before the inbox changes under them.
    engine.sync_folder_list(account_id, None).await?;
    engine.wait_for_account_ops(account_id).await?;

    let start = Instant::now();
    let summary = account.sync_inbox(grow).await?;
    info!(account_id = %account_id, "Inbox sync took {}", logger::fmt_ms(start.elapsed()));
    Ok(summary)
}
