//! DuckDB ledger store
//!
//! DuckDB is MVCC with optimistic concurrency: two transactions writing the
//! same row do not block, the second one fails with a conflict. Within one
//! store a writer lock is held for the life of each transaction, so they run
//! one after another. Claiming a row "for update" bumps its version, so a
//! writer outside this store (another process on the same file) still hits
//! a conflict at the claim, surfaced as `Error::TransientStore`.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duckdb::{params, Connection, Params, Row};
use tracing::{debug, warn};

use crate::domain::result::{Error, Result};
use crate::domain::{Account, Currency, Entry, Page, Transfer};
use crate::ports::{AccountDrift, LedgerAudit, LedgerStore, LedgerTotals, LedgerTx};
use crate::services::{MigrationResult, MigrationService};

/// Maximum number of attempts when the database file is locked
const MAX_OPEN_RETRIES: u32 = 5;

/// Initial retry delay in milliseconds (doubles each retry: 50, 100, 200, 400ms)
const INITIAL_OPEN_RETRY_DELAY_MS: u64 = 50;

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// Claims an account row for the current transaction
const CLAIM_ACCOUNT_SQL: &str = "UPDATE accounts SET version = version + 1 WHERE id = ?";

/// Check if an error message indicates a file locking issue that should be retried
fn is_file_lock_error(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    // Windows error messages
    lower.contains("being used by another process")
        || lower.contains("cannot access the file")
        // Unix/macOS error messages
        || lower.contains("resource temporarily unavailable")
        || lower.contains("database is locked")
        || lower.contains("file is already open")
}

/// Write-write or catalog conflicts between concurrent transactions
fn is_conflict(err_msg: &str) -> bool {
    err_msg.to_lowercase().contains("conflict")
}

fn is_unique_violation(err_msg: &str) -> bool {
    let lower = err_msg.to_lowercase();
    lower.contains("duplicate key") || lower.contains("unique constraint")
}

/// Classify a DuckDB error for the retry policy
fn store_error(err: duckdb::Error) -> Error {
    let msg = err.to_string();
    if is_conflict(&msg) {
        Error::TransientStore(msg)
    } else {
        Error::Database(msg)
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::database(format!("invalid timestamp {:?}: {}", s, e)))
}

fn parse_currency(s: &str) -> Result<Currency> {
    s.parse()
        .map_err(|_| Error::database(format!("unknown currency stored: {:?}", s)))
}

/// DuckDB-backed ledger store
///
/// Holds one root connection; every transaction runs on its own clone so
/// concurrent callers get independent transactions over the same database.
pub struct DuckDbStore {
    conn: Mutex<Connection>,
    writer: Mutex<()>,
    db_path: Option<PathBuf>,
}

impl DuckDbStore {
    /// Open (or create) a database file
    ///
    /// Retries with exponential backoff on file locking errors, which can
    /// occur when another process is opening the same file.
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match Self::try_open_connection(db_path) {
                Ok(conn) => {
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        writer: Mutex::new(()),
                        db_path: Some(db_path.to_path_buf()),
                    });
                }
                Err(e) => {
                    let err_msg = e.to_string();
                    attempt += 1;
                    if is_file_lock_error(&err_msg) && attempt < MAX_OPEN_RETRIES {
                        let delay =
                            Duration::from_millis(INITIAL_OPEN_RETRY_DELAY_MS * 2u64.pow(attempt - 1));
                        warn!(
                            delay_ms = delay.as_millis() as u64,
                            attempt,
                            max_attempts = MAX_OPEN_RETRIES,
                            error = %err_msg,
                            "database busy, retrying open"
                        );
                        thread::sleep(delay);
                        continue;
                    }
                    return Err(Error::database(err_msg));
                }
            }
        }
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let config = duckdb::Config::default()
            .enable_autoload_extension(false)
            .map_err(store_error)?;
        let conn = Connection::open_in_memory_with_flags(config).map_err(store_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
            writer: Mutex::new(()),
            db_path: None,
        })
    }

    fn try_open_connection(db_path: &Path) -> duckdb::Result<Connection> {
        // Extension autoloading off: the ledger only needs core SQL
        let config = duckdb::Config::default().enable_autoload_extension(false)?;
        Connection::open_with_flags(db_path, config)
    }

    /// Path of the database file, `None` for in-memory stores
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Ensure the schema exists (runs pending migrations)
    pub fn ensure_schema(&self) -> Result<MigrationResult> {
        let conn = self.connection()?;
        MigrationService::new(&conn)
            .run_pending()
            .map_err(|e| Error::database(format!("{:#}", e)))
    }

    /// A fresh connection to the shared database instance
    fn connection(&self) -> Result<Connection> {
        let root = self
            .conn
            .lock()
            .map_err(|e| Error::database(format!("connection lock poisoned: {}", e)))?;
        root.try_clone().map_err(store_error)
    }
}

impl LedgerStore for DuckDbStore {
    fn name(&self) -> &str {
        "duckdb"
    }

    fn begin(&self) -> Result<Box<dyn LedgerTx + '_>> {
        // Taken before BEGIN so the snapshot sees every earlier commit
        let writer = self
            .writer
            .lock()
            .map_err(|e| Error::database(format!("writer lock poisoned: {}", e)))?;
        let conn = self.connection()?;
        conn.execute_batch("BEGIN TRANSACTION").map_err(store_error)?;
        Ok(Box::new(DuckDbTx {
            conn,
            open: true,
            _writer: writer,
        }))
    }
}

/// One open DuckDB transaction on a dedicated connection.
/// Holds the store's writer lock until it is committed, rolled back or dropped.
struct DuckDbTx<'a> {
    conn: Connection,
    open: bool,
    _writer: MutexGuard<'a, ()>,
}

impl Drop for DuckDbTx<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

impl DuckDbTx<'_> {
    fn collect_rows<T, P, F>(&self, sql: &str, params: P, f: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> duckdb::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql).map_err(store_error)?;
        let rows = stmt.query_map(params, f).map_err(store_error)?;
        rows.collect::<duckdb::Result<Vec<T>>>().map_err(store_error)
    }

    fn next_id(&self, sequence: &str) -> Result<i64> {
        self.conn
            .query_row(&format!("SELECT nextval('{}')", sequence), [], |row| row.get(0))
            .map_err(store_error)
    }

    fn account_exists(&self, id: i64) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM accounts WHERE id = ?", params![id], |row| row.get(0))
            .map_err(store_error)?;
        Ok(count > 0)
    }
}

/// Raw account row before currency and timestamp parsing
struct AccountRow {
    id: i64,
    owner: String,
    balance: i64,
    currency: String,
    created_at: String,
}

impl AccountRow {
    fn read(row: &Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            balance: row.get(2)?,
            currency: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn into_account(self) -> Result<Account> {
        Ok(Account {
            id: self.id,
            owner: self.owner,
            balance: self.balance,
            currency: parse_currency(&self.currency)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn read_entry(row: &Row<'_>) -> duckdb::Result<(i64, i64, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn read_transfer(row: &Row<'_>) -> duckdb::Result<(i64, i64, i64, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_entry((id, account_id, amount, created_at): (i64, i64, i64, String)) -> Result<Entry> {
    Ok(Entry {
        id,
        account_id,
        amount,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn into_transfer(
    (id, from_account_id, to_account_id, amount, created_at): (i64, i64, i64, i64, String),
) -> Result<Transfer> {
    Ok(Transfer {
        id,
        from_account_id,
        to_account_id,
        amount,
        created_at: parse_timestamp(&created_at)?,
    })
}

impl LedgerTx for DuckDbTx<'_> {
    fn create_account(
        &mut self,
        owner: &str,
        currency: Currency,
        initial_balance: i64,
    ) -> Result<Account> {
        let id = self.next_id("accounts_id_seq")?;
        let created_at = Utc::now();
        let inserted = self.conn.execute(
            "INSERT INTO accounts (id, owner, balance, currency, created_at) VALUES (?, ?, ?, ?, ?)",
            params![id, owner, initial_balance, currency.code(), created_at.to_rfc3339()],
        );
        match inserted {
            Ok(_) => Ok(Account {
                id,
                owner: owner.to_string(),
                balance: initial_balance,
                currency,
                created_at,
            }),
            Err(e) if is_unique_violation(&e.to_string()) => Err(Error::DuplicateAccount {
                owner: owner.to_string(),
                currency,
            }),
            Err(e) => Err(store_error(e)),
        }
    }

    fn get_account(&mut self, id: i64) -> Result<Account> {
        let row = self.conn.query_row(
            &format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS),
            params![id],
            AccountRow::read,
        );
        match row {
            Ok(row) => row.into_account(),
            Err(duckdb::Error::QueryReturnedNoRows) => {
                Err(Error::not_found(format!("account {}", id)))
            }
            Err(e) => Err(store_error(e)),
        }
    }

    fn get_account_for_update(&mut self, id: i64) -> Result<Account> {
        let claimed = self
            .conn
            .execute(CLAIM_ACCOUNT_SQL, params![id])
            .map_err(store_error)?;
        if claimed == 0 {
            return Err(Error::not_found(format!("account {}", id)));
        }
        debug!(account_id = id, "claimed account row");
        self.get_account(id)
    }

    fn update_account_balance(&mut self, id: i64, delta: i64) -> Result<Account> {
        let updated = self
            .conn
            .execute(
                "UPDATE accounts SET balance = balance + ? WHERE id = ? AND balance + ? >= 0",
                params![delta, id, delta],
            )
            .map_err(store_error)?;
        if updated == 0 {
            if !self.account_exists(id)? {
                return Err(Error::not_found(format!("account {}", id)));
            }
            let account = self.get_account(id)?;
            return Err(Error::InsufficientFunds {
                account_id: id,
                balance: account.balance,
                requested: delta.saturating_neg(),
            });
        }
        self.get_account(id)
    }

    fn list_accounts(&mut self, owner: Option<&str>, page: Page) -> Result<Vec<Account>> {
        let rows = match owner {
            Some(owner) => self.collect_rows(
                &format!(
                    "SELECT {} FROM accounts WHERE owner = ? ORDER BY id LIMIT {} OFFSET {}",
                    ACCOUNT_COLUMNS, page.limit, page.offset
                ),
                params![owner],
                AccountRow::read,
            )?,
            None => self.collect_rows(
                &format!(
                    "SELECT {} FROM accounts ORDER BY id LIMIT {} OFFSET {}",
                    ACCOUNT_COLUMNS, page.limit, page.offset
                ),
                [],
                AccountRow::read,
            )?,
        };
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    fn create_entry(&mut self, account_id: i64, amount: i64) -> Result<Entry> {
        let id = self.next_id("entries_id_seq")?;
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO entries (id, account_id, amount, created_at) VALUES (?, ?, ?, ?)",
                params![id, account_id, amount, created_at.to_rfc3339()],
            )
            .map_err(store_error)?;
        Ok(Entry {
            id,
            account_id,
            amount,
            created_at,
        })
    }

    fn create_transfer(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        amount: i64,
    ) -> Result<Transfer> {
        let id = self.next_id("transfers_id_seq")?;
        let created_at = Utc::now();
        self.conn
            .execute(
                "INSERT INTO transfers (id, from_account_id, to_account_id, amount, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![id, from_account_id, to_account_id, amount, created_at.to_rfc3339()],
            )
            .map_err(store_error)?;
        Ok(Transfer {
            id,
            from_account_id,
            to_account_id,
            amount,
            created_at,
        })
    }

    fn list_entries(&mut self, account_id: i64, page: Page) -> Result<Vec<Entry>> {
        let rows = self.collect_rows(
            &format!(
                "SELECT {} FROM entries WHERE account_id = ? ORDER BY id LIMIT {} OFFSET {}",
                ENTRY_COLUMNS, page.limit, page.offset
            ),
            params![account_id],
            read_entry,
        )?;
        rows.into_iter().map(into_entry).collect()
    }

    fn list_transfers(&mut self, account_id: i64, page: Page) -> Result<Vec<Transfer>> {
        let rows = self.collect_rows(
            &format!(
                "SELECT {} FROM transfers
                 WHERE from_account_id = ? OR to_account_id = ?
                 ORDER BY id LIMIT {} OFFSET {}",
                TRANSFER_COLUMNS, page.limit, page.offset
            ),
            params![account_id, account_id],
            read_transfer,
        )?;
        rows.into_iter().map(into_transfer).collect()
    }

    fn ledger_totals(&mut self) -> Result<LedgerTotals> {
        let (accounts, entries, transfers): (i64, i64, i64) = self
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM accounts),
                        (SELECT COUNT(*) FROM entries),
                        (SELECT COUNT(*) FROM transfers)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(store_error)?;

        // SUM over BIGINT is a HUGEINT; read it as i128
        let sums: Vec<(String, i128)> = self.collect_rows(
            "SELECT currency, CAST(SUM(balance) AS HUGEINT) FROM accounts GROUP BY currency",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let mut balances = sums
            .into_iter()
            .map(|(currency, total)| Ok((parse_currency(&currency)?, total)))
            .collect::<Result<Vec<_>>>()?;
        balances.sort_by_key(|(currency, _)| currency.code());

        Ok(LedgerTotals {
            accounts,
            entries,
            transfers,
            balances,
        })
    }

    fn audit(&mut self) -> Result<LedgerAudit> {
        let negative_balances = self.collect_rows(
            "SELECT id FROM accounts WHERE balance < 0 ORDER BY id",
            [],
            |row| row.get(0),
        )?;

        let entry_sum: i64 = self
            .conn
            .query_row(
                "SELECT CAST(COALESCE(SUM(amount), 0) AS BIGINT) FROM entries",
                [],
                |row| row.get(0),
            )
            .map_err(store_error)?;

        let drifted_accounts = self.collect_rows(
            "WITH entry_totals AS (
                 SELECT account_id, SUM(amount) AS total FROM entries GROUP BY account_id
             ),
             transfer_totals AS (
                 SELECT account_id, SUM(delta) AS total FROM (
                     SELECT to_account_id AS account_id, amount AS delta FROM transfers
                     UNION ALL
                     SELECT from_account_id AS account_id, -amount AS delta FROM transfers
                 ) GROUP BY account_id
             )
             SELECT a.id,
                    CAST(COALESCE(e.total, 0) AS BIGINT),
                    CAST(COALESCE(t.total, 0) AS BIGINT)
             FROM accounts a
             LEFT JOIN entry_totals e ON e.account_id = a.id
             LEFT JOIN transfer_totals t ON t.account_id = a.id
             WHERE COALESCE(e.total, 0) <> COALESCE(t.total, 0)
             ORDER BY a.id",
            [],
            |row| {
                Ok(AccountDrift {
                    account_id: row.get(0)?,
                    entry_total: row.get(1)?,
                    transfer_total: row.get(2)?,
                })
            },
        )?;

        let invalid_transfers = self.collect_rows(
            "SELECT id FROM transfers
             WHERE amount <= 0 OR from_account_id = to_account_id
             ORDER BY id",
            [],
            |row| row.get(0),
        )?;

        let orphaned_entries = self.collect_rows(
            "SELECT e.id FROM entries e
             LEFT JOIN accounts a ON a.id = e.account_id
             WHERE a.id IS NULL
             ORDER BY e.id",
            [],
            |row| row.get(0),
        )?;

        let orphaned_transfers = self.collect_rows(
            "SELECT t.id FROM transfers t
             LEFT JOIN accounts f ON f.id = t.from_account_id
             LEFT JOIN accounts d ON d.id = t.to_account_id
             WHERE f.id IS NULL OR d.id IS NULL
             ORDER BY t.id",
            [],
            |row| row.get(0),
        )?;

        Ok(LedgerAudit {
            negative_balances,
            entry_sum,
            drifted_accounts,
            invalid_transfers,
            orphaned_entries,
            orphaned_transfers,
        })
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        // On failure `open` stays set and drop issues the rollback
        self.conn.execute_batch("COMMIT").map_err(store_error)?;
        self.open = false;
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.open = false;
        self.conn.execute_batch("ROLLBACK").map_err(store_error)
    }
}
