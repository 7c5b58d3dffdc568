//! SQLite-backed ledger store.
//!
//! Every atomic unit is a `BEGIN IMMEDIATE` transaction, so writers are
//! serialized by the database lock. A unit that meets the lock held by
//! another connection (SQLITE_BUSY / SQLITE_LOCKED) is rolled back and
//! re-run after a jittered backoff. Read-only units run in a deferred
//! transaction and never take the write lock.

use super::{LedgerStore, LedgerTx};
use crate::{
    config::StoreConfig,
    error::{WalletError, WalletResult},
    event::EventLogEntry,
    models::{
        DistributionStatus, LedgerTransaction, Metadata, PaymentDistribution, ReceiptRef,
        RechargeRequest, RechargeStatus, WalletAccount,
    },
    types::Timestamp,
};
use chrono::DateTime;
use rusqlite::{
    params, types::Type, Connection, ErrorCode, OpenFlags, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Applied in order; `PRAGMA user_version` records how many have run.
const MIGRATIONS: &[&str] = &[
    include_str!("../../../migrations/001_wallet.sql"),
    include_str!("../../../migrations/002_distributions.sql"),
];

pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
    path: Option<String>, // None for :memory:, Some(path) for file
    config: StoreConfig,
}

impl SqliteLedgerStore {
    pub fn open(path: &str, config: StoreConfig) -> WalletResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        Self::with_connection(conn, Some(path.to_string()), config)
    }

    /// Open a private in-memory database (used in tests).
    pub fn in_memory(config: StoreConfig) -> WalletResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, None, config)
    }

    /// Open a second connection to the same database.
    /// For in-memory databases this returns a new, isolated database.
    pub fn reopen(&self) -> WalletResult<Self> {
        match &self.path {
            Some(p) => Self::open(p, self.config.clone()),
            None => Self::in_memory(self.config.clone()),
        }
    }

    /// Apply every migration not yet recorded in `user_version`.
    pub fn migrate(&self) -> WalletResult<()> {
        let mut conn = self.lock();
        let applied: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(applied.max(0) as usize) {
            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.pragma_update(None, "user_version", (idx + 1) as i64)?;
            tx.commit()?;
            log::debug!("ledger store migrated to schema version {}", idx + 1);
        }
        Ok(())
    }

    fn with_connection(
        conn: Connection,
        path: Option<String>,
        config: StoreConfig,
    ) -> WalletResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
            config,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // An unwinding holder already rolled its transaction back on drop.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SqliteLedgerStore {
    /// Run `attempt` on the locked connection, retrying lock contention.
    fn with_retries<T>(
        &self,
        mut attempt: impl FnMut(&mut Connection) -> WalletResult<T>,
    ) -> WalletResult<T> {
        let max_attempts = self.config.max_attempts.max(1);
        for n in 1..=max_attempts {
            let result = {
                let mut conn = self.lock();
                attempt(&mut conn)
            };
            match result {
                Err(err) if is_contention(&err) => {
                    log::debug!("ledger store busy (attempt {n}/{max_attempts}): {err}");
                    std::thread::sleep(self.config.backoff(n));
                }
                other => return other,
            }
        }
        Err(WalletError::ConcurrentModification {
            attempts: max_attempts,
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn run_atomic<T, F>(&self, mut op: F) -> WalletResult<T>
    where
        F: FnMut(&mut dyn LedgerTx) -> WalletResult<T>,
    {
        self.with_retries(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // An Err drops `tx`, which rolls back.
            let value = op(&mut SqliteTx { tx: &tx })?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn read_only<T, F>(&self, mut op: F) -> WalletResult<T>
    where
        F: FnMut(&dyn LedgerTx) -> WalletResult<T>,
    {
        // Deferred: under WAL the snapshot is taken at the first read and
        // never waits for a writer.
        self.with_retries(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let value = op(&SqliteTx { tx: &tx })?;
            tx.commit()?;
            Ok(value)
        })
    }
}

fn is_contention(err: &WalletError) -> bool {
    matches!(
        err,
        WalletError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

// ── Column helpers ─────────────────────────────────────────────────

fn millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

fn sql_limit(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as unbounded.
    limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX))
}

fn conversion_error(idx: usize, ty: Type, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, detail.into())
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(idx, Type::Integer, format!("timestamp {ms} out of range")))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => ts_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn enum_col<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn metadata_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, Type::Text, e.to_string()))
}

// ── Row mapping ────────────────────────────────────────────────────

const ACCOUNT_COLUMNS: &str = "user_id, balance, currency, no_validation_trips_used,
    total_trips_completed, bonus_trips_available, created_at, last_updated";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<WalletAccount> {
    Ok(WalletAccount {
        user_id: row.get(0)?,
        balance: row.get(1)?,
        currency: row.get(2)?,
        no_validation_trips_used: row.get(3)?,
        total_trips_completed: row.get(4)?,
        bonus_trips_available: row.get(5)?,
        created_at: ts_col(row, 6)?,
        last_updated: ts_col(row, 7)?,
    })
}

const RECHARGE_COLUMNS: &str = "id, user_id, amount, receipt_url, receipt_file_name,
    sinpe_reference, status, notes, rejection_reason, requested_at, reviewed_at, reviewed_by";

fn recharge_from_row(row: &Row<'_>) -> rusqlite::Result<RechargeRequest> {
    Ok(RechargeRequest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        receipt: ReceiptRef {
            url: row.get(3)?,
            file_name: row.get(4)?,
        },
        sinpe_reference: row.get(5)?,
        status: enum_col(row, 6)?,
        notes: row.get(7)?,
        rejection_reason: row.get(8)?,
        requested_at: ts_col(row, 9)?,
        reviewed_at: opt_ts_col(row, 10)?,
        reviewed_by: row.get(11)?,
    })
}

const TRANSACTION_COLUMNS: &str = "id, user_id, kind, amount, balance_before, balance_after,
    trip_id, recharge_id, description, created_at, metadata";

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerTransaction> {
    Ok(LedgerTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: enum_col(row, 2)?,
        amount: row.get(3)?,
        balance_before: row.get(4)?,
        balance_after: row.get(5)?,
        trip_id: row.get(6)?,
        recharge_id: row.get(7)?,
        description: row.get(8)?,
        created_at: ts_col(row, 9)?,
        metadata: metadata_col(row, 10)?,
    })
}

const DISTRIBUTION_COLUMNS: &str = "id, kommuter_id, trip_id, amount, status, scheduled_for,
    processed_at, sinpe_reference, failure_reason, created_at";

fn distribution_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentDistribution> {
    Ok(PaymentDistribution {
        id: row.get(0)?,
        kommuter_id: row.get(1)?,
        trip_id: row.get(2)?,
        amount: row.get(3)?,
        status: enum_col(row, 4)?,
        scheduled_for: ts_col(row, 5)?,
        processed_at: opt_ts_col(row, 6)?,
        sinpe_reference: row.get(7)?,
        failure_reason: row.get(8)?,
        created_at: ts_col(row, 9)?,
    })
}

// ── Transaction view ───────────────────────────────────────────────

struct SqliteTx<'conn> {
    tx: &'conn Transaction<'conn>,
}

impl SqliteTx<'_> {
    fn query_list<T>(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
        map: fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> WalletResult<Vec<T>> {
        let mut stmt = self.tx.prepare_cached(sql)?;
        let rows = stmt.query_map(params, map)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl LedgerTx for SqliteTx<'_> {
    // ── Accounts ───────────────────────────────────────────────

    fn account(&self, user_id: &str) -> WalletResult<Option<WalletAccount>> {
        let account = self
            .tx
            .query_row(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM wallet_account WHERE user_id = ?1"),
                params![user_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn insert_account(&mut self, a: &WalletAccount) -> WalletResult<bool> {
        let written = self.tx.execute(
            "INSERT INTO wallet_account (
                user_id, balance, currency, no_validation_trips_used,
                total_trips_completed, bonus_trips_available, created_at, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id) DO NOTHING",
            params![
                a.user_id,
                a.balance,
                a.currency,
                a.no_validation_trips_used,
                a.total_trips_completed,
                a.bonus_trips_available,
                millis(a.created_at),
                millis(a.last_updated),
            ],
        )?;
        Ok(written == 1)
    }

    fn save_account(&mut self, a: &WalletAccount) -> WalletResult<()> {
        self.tx.execute(
            "INSERT INTO wallet_account (
                user_id, balance, currency, no_validation_trips_used,
                total_trips_completed, bonus_trips_available, created_at, last_updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(user_id) DO UPDATE SET
                balance                  = excluded.balance,
                no_validation_trips_used = excluded.no_validation_trips_used,
                total_trips_completed    = excluded.total_trips_completed,
                bonus_trips_available    = excluded.bonus_trips_available,
                last_updated             = excluded.last_updated",
            params![
                a.user_id,
                a.balance,
                a.currency,
                a.no_validation_trips_used,
                a.total_trips_completed,
                a.bonus_trips_available,
                millis(a.created_at),
                millis(a.last_updated),
            ],
        )?;
        Ok(())
    }

    // ── Recharge requests ──────────────────────────────────────

    fn recharge(&self, recharge_id: &str) -> WalletResult<Option<RechargeRequest>> {
        let recharge = self
            .tx
            .query_row(
                &format!("SELECT {RECHARGE_COLUMNS} FROM recharge_request WHERE id = ?1"),
                params![recharge_id],
                recharge_from_row,
            )
            .optional()?;
        Ok(recharge)
    }

    fn insert_recharge(&mut self, r: &RechargeRequest) -> WalletResult<()> {
        self.tx.execute(
            "INSERT INTO recharge_request (
                id, user_id, amount, receipt_url, receipt_file_name, sinpe_reference,
                status, notes, rejection_reason, requested_at, reviewed_at, reviewed_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                r.id,
                r.user_id,
                r.amount,
                r.receipt.url,
                r.receipt.file_name,
                r.sinpe_reference,
                r.status.as_str(),
                r.notes,
                r.rejection_reason,
                millis(r.requested_at),
                r.reviewed_at.map(millis),
                r.reviewed_by,
            ],
        )?;
        Ok(())
    }

    fn update_recharge(&mut self, r: &RechargeRequest) -> WalletResult<()> {
        self.tx.execute(
            "UPDATE recharge_request SET
                status = ?1, notes = ?2, rejection_reason = ?3,
                reviewed_at = ?4, reviewed_by = ?5, sinpe_reference = ?6
             WHERE id = ?7",
            params![
                r.status.as_str(),
                r.notes,
                r.rejection_reason,
                r.reviewed_at.map(millis),
                r.reviewed_by,
                r.sinpe_reference,
                r.id,
            ],
        )?;
        Ok(())
    }

    fn recharges_with_status(&self, status: RechargeStatus) -> WalletResult<Vec<RechargeRequest>> {
        self.query_list(
            &format!(
                "SELECT {RECHARGE_COLUMNS} FROM recharge_request
                 WHERE status = ?1
                 ORDER BY requested_at DESC, rowid DESC"
            ),
            params![status.as_str()],
            recharge_from_row,
        )
    }

    fn user_recharges(&self, user_id: &str) -> WalletResult<Vec<RechargeRequest>> {
        self.query_list(
            &format!(
                "SELECT {RECHARGE_COLUMNS} FROM recharge_request
                 WHERE user_id = ?1
                 ORDER BY requested_at DESC, rowid DESC"
            ),
            params![user_id],
            recharge_from_row,
        )
    }

    // ── Ledger transactions ────────────────────────────────────

    fn append_transaction(&mut self, t: &LedgerTransaction) -> WalletResult<()> {
        let metadata = serde_json::to_string(&t.metadata)?;
        self.tx.execute(
            "INSERT INTO ledger_transaction (
                id, user_id, kind, amount, balance_before, balance_after,
                trip_id, recharge_id, description, created_at, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                t.id,
                t.user_id,
                t.kind.as_str(),
                t.amount,
                t.balance_before,
                t.balance_after,
                t.trip_id,
                t.recharge_id,
                t.description,
                millis(t.created_at),
                metadata,
            ],
        )?;
        Ok(())
    }

    fn user_transactions(
        &self,
        user_id: &str,
        limit: Option<usize>,
    ) -> WalletResult<Vec<LedgerTransaction>> {
        self.query_list(
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction
                 WHERE user_id = ?1
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?2"
            ),
            params![user_id, sql_limit(limit)],
            transaction_from_row,
        )
    }

    fn all_transactions(&self, limit: Option<usize>) -> WalletResult<Vec<LedgerTransaction>> {
        self.query_list(
            &format!(
                "SELECT {TRANSACTION_COLUMNS} FROM ledger_transaction
                 ORDER BY created_at DESC, seq DESC
                 LIMIT ?1"
            ),
            params![sql_limit(limit)],
            transaction_from_row,
        )
    }

    fn user_transaction_count(&self, user_id: &str) -> WalletResult<u64> {
        let count: i64 = self.tx.query_row(
            "SELECT COUNT(*) FROM ledger_transaction WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Payment distributions ──────────────────────────────────

    fn distribution(&self, distribution_id: &str) -> WalletResult<Option<PaymentDistribution>> {
        let distribution = self
            .tx
            .query_row(
                &format!("SELECT {DISTRIBUTION_COLUMNS} FROM payment_distribution WHERE id = ?1"),
                params![distribution_id],
                distribution_from_row,
            )
            .optional()?;
        Ok(distribution)
    }

    fn insert_distribution(&mut self, d: &PaymentDistribution) -> WalletResult<()> {
        self.tx.execute(
            "INSERT INTO payment_distribution (
                id, kommuter_id, trip_id, amount, status, scheduled_for,
                processed_at, sinpe_reference, failure_reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                d.id,
                d.kommuter_id,
                d.trip_id,
                d.amount,
                d.status.as_str(),
                millis(d.scheduled_for),
                d.processed_at.map(millis),
                d.sinpe_reference,
                d.failure_reason,
                millis(d.created_at),
            ],
        )?;
        Ok(())
    }

    fn update_distribution(&mut self, d: &PaymentDistribution) -> WalletResult<()> {
        self.tx.execute(
            "UPDATE payment_distribution SET
                status = ?1, processed_at = ?2, sinpe_reference = ?3, failure_reason = ?4
             WHERE id = ?5",
            params![
                d.status.as_str(),
                d.processed_at.map(millis),
                d.sinpe_reference,
                d.failure_reason,
                d.id,
            ],
        )?;
        Ok(())
    }

    fn distributions_due(
        &self,
        status: DistributionStatus,
        until: Timestamp,
    ) -> WalletResult<Vec<PaymentDistribution>> {
        self.query_list(
            &format!(
                "SELECT {DISTRIBUTION_COLUMNS} FROM payment_distribution
                 WHERE status = ?1 AND scheduled_for <= ?2
                 ORDER BY scheduled_for ASC, rowid ASC"
            ),
            params![status.as_str(), millis(until)],
            distribution_from_row,
        )
    }

    fn kommuter_distributions(&self, kommuter_id: &str) -> WalletResult<Vec<PaymentDistribution>> {
        self.query_list(
            &format!(
                "SELECT {DISTRIBUTION_COLUMNS} FROM payment_distribution
                 WHERE kommuter_id = ?1
                 ORDER BY created_at DESC, rowid DESC"
            ),
            params![kommuter_id],
            distribution_from_row,
        )
    }

    // ── Event log ──────────────────────────────────────────────

    fn append_event(&mut self, entry: &EventLogEntry) -> WalletResult<()> {
        self.tx.execute(
            "INSERT INTO event_log (event_type, payload, recorded_at) VALUES (?1, ?2, ?3)",
            params![entry.event_type, entry.payload, millis(entry.recorded_at)],
        )?;
        Ok(())
    }

    fn recent_events(&self, limit: usize) -> WalletResult<Vec<EventLogEntry>> {
        self.query_list(
            "SELECT id, event_type, payload, recorded_at FROM event_log
             ORDER BY id DESC LIMIT ?1",
            params![sql_limit(Some(limit))],
            |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    event_type: row.get(1)?,
                    payload: row.get(2)?,
                    recorded_at: ts_col(row, 3)?,
                })
            },
        )
    }
}
