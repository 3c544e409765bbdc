use crate::errors::Error;
use crate::models::{NewPayout, Payout};
use chrono::NaiveDateTime;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::{self, prelude::*};
use log::error;
use std::path::Path;

/// sqlite has no native decimal; amounts live as BIGINT atomic units.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS payouts (
    id INTEGER PRIMARY KEY NOT NULL,
    pid TEXT NOT NULL UNIQUE,
    user TEXT NOT NULL,
    address TEXT NOT NULL,
    amount BIGINT NOT NULL,
    currency_code TEXT NOT NULL,
    txid TEXT,
    locked BOOLEAN NOT NULL DEFAULT 0,
    associated BOOLEAN NOT NULL DEFAULT 0,
    lock_time TIMESTAMP,
    paid_time TIMESTAMP,
    assoc_time TIMESTAMP,
    pull_time TIMESTAMP NOT NULL
);
";

const DROP_SQL: &str = "DROP TABLE IF EXISTS payouts;";

type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
type Conn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Durable, single-writer store for one currency's payouts. The pool holds
/// exactly one connection, and every state change runs under BEGIN EXCLUSIVE,
/// so the `locked` flag always flips atomically with the row set it covers.
pub struct PayoutStore {
    pool: SqlitePool,
}

impl PayoutStore {
    /// Open (creating if needed) `rpc_<CODE>.sqlite` under `directory`.
    pub fn open(directory: &Path, currency_code: &str) -> Result<Self, Error> {
        let path = directory.join(format!("rpc_{}.sqlite", currency_code));
        let url = path
            .to_str()
            .ok_or_else(|| Error::Config(format!("unusable database path {:?}", path)))?
            .to_owned();
        Self::open_url(&url)
    }

    /// Private in-memory store; lives as long as the pool's one connection.
    pub fn in_memory() -> Result<Self, Error> {
        Self::open_url(":memory:")
    }

    fn open_url(url: &str) -> Result<Self, Error> {
        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder().max_size(1).build(manager)?;
        let conn = pool.get()?;
        // Writers queue on the exclusive begin instead of erroring out.
        conn.batch_execute("PRAGMA busy_timeout = 60000;")?;
        conn.batch_execute(SCHEMA_SQL)?;
        Ok(PayoutStore { pool })
    }

    fn conn(&self) -> Result<Conn, Error> {
        self.pool.get().map_err(|e| e.into())
    }

    /// Run `f` inside one BEGIN EXCLUSIVE transaction. `Err` rolls back.
    /// diesel's `transaction()` opens a plain deferred BEGIN; the locking
    /// step needs the exclusive variant, so the transaction is managed by
    /// hand.
    pub fn with_exclusive<T, F>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&SqliteConnection) -> Result<T, Error>,
    {
        let conn = self.conn()?;
        conn.batch_execute("BEGIN EXCLUSIVE")?;
        match f(&conn) {
            Ok(value) => match conn.batch_execute("COMMIT") {
                Ok(()) => Ok(value),
                Err(commit_error) => {
                    if let Err(rollback_error) = conn.batch_execute("ROLLBACK") {
                        error!("rollback after failed commit: {}", rollback_error);
                    }
                    Err(commit_error.into())
                }
            },
            Err(error) => {
                if let Err(rollback_error) = conn.batch_execute("ROLLBACK") {
                    error!("rollback after failed transaction: {}", rollback_error);
                }
                Err(error)
            }
        }
    }

    /// Destructive reset: drop and recreate the payouts table.
    pub fn drop_and_create(&self) -> Result<(), Error> {
        let conn = self.conn()?;
        conn.batch_execute(DROP_SQL)?;
        conn.batch_execute(SCHEMA_SQL)?;
        Ok(())
    }
}

pub fn insert_payout(conn: &SqliteConnection, new: &NewPayout) -> Result<(), Error> {
    use crate::schema::payouts;
    diesel::insert_into(payouts::table)
        .values(new)
        .execute(conn)?;
    Ok(())
}

pub fn by_pid(
    conn: &SqliteConnection,
    payout_pid: &str,
    currency: &str,
) -> Result<Option<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    payouts
        .filter(pid.eq(payout_pid))
        .filter(currency_code.eq(currency))
        .first::<Payout>(conn)
        .optional()
        .map_err(|e| e.into())
}

/// PULLED rows: ready to be grouped into a transaction.
pub fn unpaid_unlocked(conn: &SqliteConnection, currency: &str) -> Result<Vec<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    payouts
        .filter(txid.is_null())
        .filter(locked.eq(false))
        .filter(currency_code.eq(currency))
        .order(id.asc())
        .load::<Payout>(conn)
        .map_err(|e| e.into())
}

/// LOCKED rows: a send was attempted (or is in flight) and no txid is known.
pub fn unpaid_locked(conn: &SqliteConnection, currency: &str) -> Result<Vec<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    payouts
        .filter(txid.is_null())
        .filter(locked.eq(true))
        .filter(currency_code.eq(currency))
        .order(id.asc())
        .load::<Payout>(conn)
        .map_err(|e| e.into())
}

/// PAID rows: the coordinator has not yet been told about their txid.
pub fn paid_unassociated(conn: &SqliteConnection, currency: &str) -> Result<Vec<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    payouts
        .filter(txid.is_not_null())
        .filter(associated.eq(false))
        .filter(currency_code.eq(currency))
        .order(id.asc())
        .load::<Payout>(conn)
        .map_err(|e| e.into())
}

/// ASSOCIATED rows: settled end to end, kept for audit.
pub fn complete(conn: &SqliteConnection, currency: &str) -> Result<Vec<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    payouts
        .filter(txid.is_not_null())
        .filter(associated.eq(true))
        .filter(currency_code.eq(currency))
        .order(id.asc())
        .load::<Payout>(conn)
        .map_err(|e| e.into())
}

pub fn lock_rows(
    conn: &SqliteConnection,
    ids: &[i32],
    now: NaiveDateTime,
) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(payouts.filter(id.eq_any(ids)))
        .set((locked.eq(true), lock_time.eq(now)))
        .execute(conn)
        .map_err(|e| e.into())
}

/// Undo a lock after a send that provably moved no funds. `lock_time` stays
/// behind as evidence of the attempt.
pub fn unlock_rows(conn: &SqliteConnection, ids: &[i32]) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(payouts.filter(id.eq_any(ids)))
        .set(locked.eq(false))
        .execute(conn)
        .map_err(|e| e.into())
}

/// Record a successful send: rows gain the txid and leave the locked state.
pub fn mark_paid(
    conn: &SqliteConnection,
    ids: &[i32],
    coin_txid: &str,
    now: NaiveDateTime,
) -> Result<Vec<Payout>, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(payouts.filter(id.eq_any(ids)))
        .set((locked.eq(false), txid.eq(coin_txid), paid_time.eq(now)))
        .execute(conn)?;
    payouts
        .filter(id.eq_any(ids))
        .order(id.asc())
        .load::<Payout>(conn)
        .map_err(|e| e.into())
}

pub fn mark_associated(
    conn: &SqliteConnection,
    ids: &[i32],
    now: NaiveDateTime,
) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(payouts.filter(id.eq_any(ids)))
        .set((associated.eq(true), assoc_time.eq(now)))
        .execute(conn)
        .map_err(|e| e.into())
}

pub fn reset_locked(conn: &SqliteConnection, currency: &str) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(
        payouts
            .filter(locked.eq(true))
            .filter(currency_code.eq(currency)),
    )
    .set(locked.eq(false))
    .execute(conn)
    .map_err(|e| e.into())
}

/// Attach a known txid to a single LOCKED row, releasing the lock.
pub fn local_associate_locked(
    conn: &SqliteConnection,
    row_id: i32,
    currency: &str,
    coin_txid: &str,
    now: NaiveDateTime,
) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(
        payouts
            .filter(id.eq(row_id))
            .filter(txid.is_null())
            .filter(locked.eq(true))
            .filter(currency_code.eq(currency)),
    )
    .set((txid.eq(coin_txid), locked.eq(false), paid_time.eq(now)))
    .execute(conn)
    .map_err(|e| e.into())
}

/// Attach a known txid to every LOCKED row of the currency.
pub fn local_associate_all_locked(
    conn: &SqliteConnection,
    currency: &str,
    coin_txid: &str,
    now: NaiveDateTime,
) -> Result<usize, Error> {
    use crate::schema::payouts::dsl::*;
    diesel::update(
        payouts
            .filter(txid.is_null())
            .filter(locked.eq(true))
            .filter(currency_code.eq(currency)),
    )
    .set((txid.eq(coin_txid), locked.eq(false), paid_time.eq(now)))
    .execute(conn)
    .map_err(|e| e.into())
}
