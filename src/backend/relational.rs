//! Embedded relational engine: SQLite behind a bounded connection pool.

use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, ToSql};
use tempfile::TempDir;
use tracing::debug;

use super::{Backend, BackendError, Execution, RelationalOptions, ResultSummary};
use crate::catalog::{ParamValue, QueryDefinition, QueryParams};
use crate::dataset::Dataset;
use crate::model::{Schema, Variant};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE products (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    price REAL NOT NULL,
    stock INTEGER NOT NULL
);
CREATE TABLE product_categories (
    product_id INTEGER NOT NULL,
    category_id INTEGER NOT NULL,
    PRIMARY KEY (product_id, category_id)
);
CREATE TABLE addresses (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    street TEXT NOT NULL,
    city TEXT NOT NULL,
    zip TEXT NOT NULL
);
CREATE TABLE orders (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE order_items (
    id INTEGER PRIMARY KEY,
    order_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL
);
CREATE TABLE reviews (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    rating INTEGER NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE cart_items (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    added_at INTEGER NOT NULL
);
CREATE TABLE product_views (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    viewed_at INTEGER NOT NULL
);
CREATE TABLE product_purchases (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    product_id INTEGER NOT NULL,
    purchased_at INTEGER NOT NULL
);
CREATE TABLE dataset_meta (
    anchor INTEGER NOT NULL
);
";

const SECONDARY_INDEXES: &str = "
CREATE INDEX idx_pc_category ON product_categories (category_id, product_id);
CREATE INDEX idx_orders_user ON orders (user_id);
CREATE INDEX idx_orders_recent ON orders (created_at DESC, id DESC);
CREATE INDEX idx_items_order ON order_items (order_id);
CREATE INDEX idx_items_product ON order_items (product_id);
CREATE INDEX idx_reviews_product ON reviews (product_id);
CREATE INDEX idx_reviews_recent ON reviews (created_at DESC, id DESC);
CREATE INDEX idx_addresses_user ON addresses (user_id);
ANALYZE;
";

impl ToSql for ParamValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ParamValue::Int(value) => ToSqlOutput::Owned(Value::Integer(*value)),
            ParamValue::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
        })
    }
}

/// SQLite database seeded from a dataset, one file per variant.
pub struct RelationalBackend {
    variant: Variant,
    path: PathBuf,
    pool: ConnectionPool,
    _scratch: Option<TempDir>,
}

impl RelationalBackend {
    /// Creates the database file, loads `dataset` and, for the optimized
    /// schema, builds secondary indexes.
    pub fn create(
        variant: Variant,
        dataset: &Dataset,
        options: &RelationalOptions,
    ) -> Result<Self, BackendError> {
        let (dir, scratch) = match &options.dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|err| {
                    BackendError::Unavailable(format!("cannot create {}: {err}", dir.display()))
                })?;
                (dir.clone(), None)
            }
            None => {
                let scratch = tempfile::tempdir().map_err(|err| {
                    BackendError::Unavailable(format!("cannot create scratch dir: {err}"))
                })?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };
        let path = dir.join(format!("{}.sqlite3", variant.label()));
        remove_database_files(&path);

        let started = Instant::now();
        let mut conn = Connection::open(&path).map_err(setup_error)?;
        build(&mut conn, dataset, variant.schema()).map_err(setup_error)?;
        drop(conn);
        debug!(
            variant = %variant,
            path = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relational database seeded"
        );

        Ok(Self {
            variant,
            pool: ConnectionPool::new(path.clone(), options.pool_size.max(1), options.busy_timeout),
            path,
            _scratch: scratch,
        })
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Variant this database was built for.
    pub fn variant(&self) -> Variant {
        self.variant
    }
}

impl Backend for RelationalBackend {
    fn connect(&self) -> Result<(), BackendError> {
        self.pool.open.store(true, Ordering::Release);
        let conn = self.pool.acquire()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        Ok(())
    }

    fn execute(
        &self,
        query: &QueryDefinition,
        params: &QueryParams,
    ) -> Result<Execution, BackendError> {
        let conn = self.pool.acquire()?;
        let started = Instant::now();
        let rows = run_statement(&conn, query.sql, params).map_err(classify)?;
        Ok(Execution {
            summary: ResultSummary { rows },
            elapsed: started.elapsed(),
        })
    }

    fn close(&self) {
        self.pool.close();
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &QueryParams) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    let bound: Vec<(&str, &dyn ToSql)> = params
        .iter()
        .map(|(name, value)| (name, value as &dyn ToSql))
        .collect();
    let mut rows = stmt.query(bound.as_slice())?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

fn classify(err: rusqlite::Error) -> BackendError {
    match err.sqlite_error_code() {
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::SystemIoFailure,
        ) => BackendError::Unavailable(err.to_string()),
        _ => BackendError::QueryExecution(err.to_string()),
    }
}

fn setup_error(err: rusqlite::Error) -> BackendError {
    BackendError::Unavailable(format!("failed to prepare database: {err}"))
}

fn remove_database_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        let _ = fs::remove_file(PathBuf::from(name));
    }
}

fn build(conn: &mut Connection, data: &Dataset, schema: Schema) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(SCHEMA)?;

    let tx = conn.transaction()?;
    {
        tx.execute("INSERT INTO dataset_meta (anchor) VALUES (?1)", [data.anchor])?;
        let mut stmt = tx.prepare("INSERT INTO users VALUES (?1, ?2, ?3, ?4)")?;
        for u in &data.users {
            stmt.execute(params![u.id, u.name, u.email, u.created_at])?;
        }
        let mut stmt = tx.prepare("INSERT INTO categories VALUES (?1, ?2)")?;
        for c in &data.categories {
            stmt.execute(params![c.id, c.name])?;
        }
        let mut stmt = tx.prepare("INSERT INTO products VALUES (?1, ?2, ?3, ?4)")?;
        for p in &data.products {
            stmt.execute(params![p.id, p.name, p.price, p.stock])?;
        }
        let mut stmt = tx.prepare("INSERT INTO product_categories VALUES (?1, ?2)")?;
        for pc in &data.product_categories {
            stmt.execute(params![pc.product_id, pc.category_id])?;
        }
        let mut stmt = tx.prepare("INSERT INTO addresses VALUES (?1, ?2, ?3, ?4, ?5)")?;
        for a in &data.addresses {
            stmt.execute(params![a.id, a.user_id, a.street, a.city, a.zip])?;
        }
        let mut stmt = tx.prepare("INSERT INTO orders VALUES (?1, ?2, ?3, ?4)")?;
        for o in &data.orders {
            stmt.execute(params![o.id, o.user_id, o.created_at, o.status])?;
        }
        let mut stmt = tx.prepare("INSERT INTO order_items VALUES (?1, ?2, ?3, ?4, ?5)")?;
        for i in &data.order_items {
            stmt.execute(params![i.id, i.order_id, i.product_id, i.quantity, i.unit_price])?;
        }
        let mut stmt = tx.prepare("INSERT INTO reviews VALUES (?1, ?2, ?3, ?4, ?5, ?6)")?;
        for r in &data.reviews {
            stmt.execute(params![r.id, r.user_id, r.product_id, r.rating, r.body, r.created_at])?;
        }
        let mut stmt = tx.prepare("INSERT INTO cart_items VALUES (?1, ?2, ?3, ?4, ?5)")?;
        for c in &data.cart_items {
            stmt.execute(params![c.id, c.user_id, c.product_id, c.quantity, c.added_at])?;
        }
        let mut stmt = tx.prepare("INSERT INTO product_views VALUES (?1, ?2, ?3, ?4)")?;
        for v in &data.product_views {
            stmt.execute(params![v.id, v.user_id, v.product_id, v.viewed_at])?;
        }
        let mut stmt = tx.prepare("INSERT INTO product_purchases VALUES (?1, ?2, ?3, ?4)")?;
        for p in &data.product_purchases {
            stmt.execute(params![p.id, p.user_id, p.product_id, p.purchased_at])?;
        }
    }
    tx.commit()?;

    if schema == Schema::Optimized {
        conn.execute_batch(SECONDARY_INDEXES)?;
    }
    Ok(())
}

struct PoolState {
    idle: Vec<Connection>,
    live: usize,
}

struct ConnectionPool {
    path: PathBuf,
    capacity: usize,
    busy_timeout: Duration,
    state: Mutex<PoolState>,
    returned: Condvar,
    open: AtomicBool,
}

impl ConnectionPool {
    fn new(path: PathBuf, capacity: usize, busy_timeout: Duration) -> Self {
        Self {
            path,
            capacity,
            busy_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                live: 0,
            }),
            returned: Condvar::new(),
            open: AtomicBool::new(false),
        }
    }

    fn acquire(&self) -> Result<PooledConnection<'_>, BackendError> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        let mut state = self.state.lock();
        loop {
            if !self.open.load(Ordering::Acquire) {
                return Err(BackendError::Unavailable("connection pool is closed".into()));
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if state.live < self.capacity {
                state.live += 1;
                drop(state);
                return match self.open_connection() {
                    Ok(conn) => Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(err) => {
                        self.state.lock().live -= 1;
                        self.returned.notify_one();
                        Err(err)
                    }
                };
            }
            if self.returned.wait_until(&mut state, deadline).timed_out() {
                return Err(BackendError::Unavailable(format!(
                    "no connection released within {}s",
                    ACQUIRE_TIMEOUT.as_secs()
                )));
            }
        }
    }

    fn open_connection(&self) -> Result<Connection, BackendError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|err| BackendError::Unavailable(err.to_string()))?;
        conn.set_prepared_statement_cache_capacity(32);
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if self.open.load(Ordering::Acquire) {
            state.idle.push(conn);
        } else {
            state.live -= 1;
            drop(state);
            drop(conn);
        }
        self.returned.notify_one();
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        let drained = {
            let mut state = self.state.lock();
            let drained = std::mem::take(&mut state.idle);
            state.live -= drained.len();
            drained
        };
        drop(drained);
        self.returned.notify_all();
    }
}

struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
