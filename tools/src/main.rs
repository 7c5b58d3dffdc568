//! wallet-runner: headless command loop over the wallet engine.
//!
//! Usage:
//!   wallet-runner --db wallet.db --config wallet.json --profiles payees.json
//!   wallet-runner --db wallet.db --due
//!
//! Without `--due`, reads one JSON command per line on stdin and writes one
//! JSON response per line on stdout: `{"ok": ...}` or `{"error": "..."}`.

use anyhow::Result;
use chrono::Utc;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use wallet_core::{
    config::WalletConfig,
    models::ReceiptRef,
    profile::StaticProfileDirectory,
    store::SqliteLedgerStore,
    types::{Amount, Timestamp},
    WalletEngine, WalletResult,
};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    GetBalance {
        user_id: String,
    },
    InitializeBalance {
        user_id: String,
    },
    CreateRecharge {
        user_id: String,
        amount: Amount,
        receipt_url: String,
        receipt_file_name: String,
        #[serde(default)]
        sinpe_reference: Option<String>,
    },
    ListPending,
    Approve {
        recharge_id: String,
        reviewer_id: String,
        #[serde(default)]
        notes: Option<String>,
    },
    Reject {
        recharge_id: String,
        reviewer_id: String,
        reason: String,
    },
    GetRecharge {
        recharge_id: String,
    },
    UserRecharges {
        user_id: String,
    },
    GetUserTransactions {
        user_id: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    GetAllTransactions {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    GetStats {
        user_id: String,
    },
    HoldFundsForTrip {
        user_id: String,
        trip_id: String,
        amount: Amount,
    },
    Schedule {
        kommuter_id: String,
        trip_id: String,
        amount: Amount,
    },
    ListDue {
        #[serde(default)]
        now: Option<Timestamp>,
    },
    MarkProcessing {
        distribution_id: String,
    },
    MarkCompleted {
        distribution_id: String,
        sinpe_reference: String,
    },
    MarkFailed {
        distribution_id: String,
        reason: String,
    },
    GetDistribution {
        distribution_id: String,
    },
    KommuterDistributions {
        kommuter_id: String,
    },
    RecentEvents {
        #[serde(default = "default_limit")]
        limit: usize,
    },
    Quit,
}

fn default_limit() -> usize {
    50
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let due_mode = args.iter().any(|a| a == "--due");

    let config = match flag_value(&args, "--config") {
        Some(path) => WalletConfig::load(path)?,
        None => WalletConfig::default(),
    };
    let profiles = match flag_value(&args, "--profiles") {
        Some(path) => StaticProfileDirectory::load(path)?,
        None => StaticProfileDirectory::new(),
    };

    let engine = WalletEngine::open_sqlite(db, Arc::new(profiles), config)?;
    log::info!("wallet-runner ready on {db}");

    if due_mode {
        let due = engine.list_due(Utc::now())?;
        println!("{}", serde_json::to_string_pretty(&due)?);
        return Ok(());
    }

    run_ipc_loop(&engine)
}

fn run_ipc_loop(engine: &WalletEngine<SqliteLedgerStore>) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                let err_json = serde_json::json!({ "error": e.to_string() });
                writeln!(stdout, "{}", err_json)?;
                stdout.flush()?;
                continue;
            }
        };
        if matches!(cmd, IpcCommand::Quit) {
            break;
        }

        let response = match dispatch(engine, cmd) {
            Ok(value) => serde_json::json!({ "ok": value }),
            Err(e) => {
                log::warn!("command failed: {e}");
                serde_json::json!({ "error": e.to_string() })
            }
        };
        writeln!(stdout, "{}", response)?;
        stdout.flush()?;
    }
    Ok(())
}

fn dispatch(
    engine: &WalletEngine<SqliteLedgerStore>,
    cmd: IpcCommand,
) -> WalletResult<serde_json::Value> {
    let value = match cmd {
        IpcCommand::GetBalance { user_id } => serde_json::to_value(engine.get_balance(&user_id)?)?,
        IpcCommand::InitializeBalance { user_id } => {
            serde_json::to_value(engine.initialize_balance(&user_id)?)?
        }
        IpcCommand::CreateRecharge {
            user_id,
            amount,
            receipt_url,
            receipt_file_name,
            sinpe_reference,
        } => serde_json::to_value(engine.create_recharge(
            &user_id,
            amount,
            ReceiptRef::new(receipt_url, receipt_file_name),
            sinpe_reference,
        )?)?,
        IpcCommand::ListPending => serde_json::to_value(engine.list_pending()?)?,
        IpcCommand::Approve {
            recharge_id,
            reviewer_id,
            notes,
        } => serde_json::to_value(engine.approve(&recharge_id, &reviewer_id, notes)?)?,
        IpcCommand::Reject {
            recharge_id,
            reviewer_id,
            reason,
        } => serde_json::to_value(engine.reject(&recharge_id, &reviewer_id, &reason)?)?,
        IpcCommand::GetRecharge { recharge_id } => {
            serde_json::to_value(engine.recharges.get_recharge(&recharge_id)?)?
        }
        IpcCommand::UserRecharges { user_id } => {
            serde_json::to_value(engine.recharges.user_recharges(&user_id)?)?
        }
        IpcCommand::GetUserTransactions { user_id, limit } => {
            serde_json::to_value(engine.get_user_transactions(&user_id, limit)?)?
        }
        IpcCommand::GetAllTransactions { limit } => {
            serde_json::to_value(engine.get_all_transactions(limit)?)?
        }
        IpcCommand::GetStats { user_id } => serde_json::to_value(engine.get_stats(&user_id)?)?,
        IpcCommand::HoldFundsForTrip {
            user_id,
            trip_id,
            amount,
        } => serde_json::to_value(engine.hold_funds_for_trip(&user_id, &trip_id, amount)?)?,
        IpcCommand::Schedule {
            kommuter_id,
            trip_id,
            amount,
        } => serde_json::to_value(engine.schedule(&kommuter_id, &trip_id, amount)?)?,
        IpcCommand::ListDue { now } => {
            serde_json::to_value(engine.list_due(now.unwrap_or_else(Utc::now))?)?
        }
        IpcCommand::MarkProcessing { distribution_id } => {
            serde_json::to_value(engine.mark_processing(&distribution_id)?)?
        }
        IpcCommand::MarkCompleted {
            distribution_id,
            sinpe_reference,
        } => serde_json::to_value(engine.mark_completed(&distribution_id, &sinpe_reference)?)?,
        IpcCommand::MarkFailed {
            distribution_id,
            reason,
        } => serde_json::to_value(engine.mark_failed(&distribution_id, &reason)?)?,
        IpcCommand::GetDistribution { distribution_id } => {
            serde_json::to_value(engine.distributions.get_distribution(&distribution_id)?)?
        }
        IpcCommand::KommuterDistributions { kommuter_id } => {
            serde_json::to_value(engine.distributions.kommuter_distributions(&kommuter_id)?)?
        }
        IpcCommand::RecentEvents { limit } => serde_json::to_value(engine.recent_events(limit)?)?,
        IpcCommand::Quit => serde_json::Value::Null,
    };
    Ok(value)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}
