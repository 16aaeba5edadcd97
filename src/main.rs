use accrual_engine::application::engine::AccrualEngine;
use accrual_engine::config::Config;
use accrual_engine::domain::ports::{SharedLedgerStore, SharedOrderStore};
use accrual_engine::domain::user::UserId;
use accrual_engine::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryOrderStore};
#[cfg(feature = "storage-rocksdb")]
use accrual_engine::infrastructure::rocksdb::RocksDBStore;
use accrual_engine::interfaces::csv::balance_writer::BalanceWriter;
use accrual_engine::interfaces::csv::command_reader::{Command, CommandReader, CommandType};
use accrual_engine::interfaces::http::loyalty_client::HttpLoyaltyClient;
use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();
}

fn in_memory_stores() -> (SharedOrderStore, SharedLedgerStore) {
    (
        Arc::new(InMemoryOrderStore::new()),
        Arc::new(InMemoryLedgerStore::new()),
    )
}

fn open_stores(db_path: Option<PathBuf>) -> Result<(SharedOrderStore, SharedLedgerStore)> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = RocksDBStore::open(&path).into_diagnostic()?;
            tracing::info!(path = %path.display(), "using RocksDB storage");
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' \
                 feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(in_memory_stores())
        }
        None => Ok(in_memory_stores()),
    }
}

/// Waits until every submitted order settled. Returns `false` on Ctrl-C.
async fn settle(engine: &AccrualEngine) -> bool {
    tokio::select! {
        _ = engine.wait_idle() => true,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping");
            false
        }
    }
}

async fn apply(engine: &AccrualEngine, command: &Command) -> accrual_engine::error::Result<()> {
    match command.kind {
        CommandType::Order => {
            let outcome = engine.submit_order(&command.order, &command.user).await?;
            tracing::debug!(
                order = %command.order,
                user = %command.user,
                ?outcome,
                "order submitted"
            );
        }
        CommandType::Withdraw => {
            let amount = command.amount.unwrap_or_default();
            engine.withdraw(&command.user, &command.order, amount).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    let (orders, ledger) = open_stores(config.db_path.clone())?;
    let client = HttpLoyaltyClient::new(&config.accrual_address, config.request_timeout())
        .into_diagnostic()?;
    let engine = AccrualEngine::new(orders, ledger, Arc::new(client), config.poll_settings());

    engine
        .start_synchronizer(config.concurrency)
        .await
        .into_diagnostic()?;

    // Withdrawals apply once every order submitted before them has settled.
    let file = File::open(&config.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let mut users = BTreeSet::<UserId>::new();
    let mut interrupted = false;
    for (line, command) in reader.commands().enumerate() {
        let command = match command {
            Ok(command) => command,
            Err(error) => {
                tracing::warn!(line = line + 2, %error, "skipping unreadable command");
                continue;
            }
        };
        users.insert(command.user.clone());

        if command.kind == CommandType::Withdraw && !settle(&engine).await {
            interrupted = true;
            break;
        }
        if let Err(error) = apply(&engine, &command).await {
            tracing::warn!(
                line = line + 2,
                user = %command.user,
                order = %command.order,
                %error,
                "command rejected"
            );
        }
    }

    if !interrupted {
        settle(&engine).await;
    }
    engine.stop(config.shutdown_timeout()).await;

    let mut balances = Vec::with_capacity(users.len());
    for user in &users {
        balances.push(engine.balance(user).await.into_diagnostic()?);
    }
    let stdout = io::stdout();
    let mut writer = BalanceWriter::new(stdout.lock());
    writer.write_balances(&balances).into_diagnostic()?;

    Ok(())
}
