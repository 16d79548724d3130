//! Core value types shared by the executor, the aggregation engine and the sinks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Concurrency levels a sweep may exercise.
pub const CONCURRENCY_LEVELS: [usize; 4] = [1, 3, 5, 10];

/// User-count tier of a generated dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Scale {
    /// 1 000 users.
    Users1k,
    /// 10 000 users.
    Users10k,
    /// 100 000 users.
    Users100k,
}

impl Scale {
    /// Every tier, smallest first.
    pub const ALL: [Scale; 3] = [Scale::Users1k, Scale::Users10k, Scale::Users100k];

    /// Number of users seeded for this tier.
    pub fn users(self) -> u32 {
        match self {
            Scale::Users1k => 1_000,
            Scale::Users10k => 10_000,
            Scale::Users100k => 100_000,
        }
    }
}

impl TryFrom<u32> for Scale {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Scale::ALL
            .into_iter()
            .find(|scale| scale.users() == value)
            .ok_or_else(|| format!("unsupported scale tier {value} (expected 1000, 10000 or 100000)"))
    }
}

impl From<Scale> for u32 {
    fn from(value: Scale) -> Self {
        value.users()
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.users())
    }
}

/// Database engine family under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BackendKind {
    /// Table store queried with SQL.
    Relational,
    /// Property graph traversed natively.
    Graph,
}

/// Schema flavour of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Schema {
    /// Primary keys only / intermediate nodes for line items.
    Normal,
    /// Secondary indexes / direct relationship shortcuts.
    Optimized,
}

/// A backend/optimization combination under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Relational store without secondary indexes.
    RelationalNormal,
    /// Relational store with secondary indexes.
    RelationalOptimized,
    /// Graph store with intermediate line-item nodes.
    GraphNormal,
    /// Graph store with direct relationship shortcuts.
    GraphOptimized,
}

impl Variant {
    /// Every variant in reporting order.
    pub const ALL: [Variant; 4] = [
        Variant::RelationalNormal,
        Variant::RelationalOptimized,
        Variant::GraphNormal,
        Variant::GraphOptimized,
    ];

    /// Engine family of this variant.
    pub fn backend(self) -> BackendKind {
        match self {
            Variant::RelationalNormal | Variant::RelationalOptimized => BackendKind::Relational,
            Variant::GraphNormal | Variant::GraphOptimized => BackendKind::Graph,
        }
    }

    /// Schema flavour of this variant.
    pub fn schema(self) -> Schema {
        match self {
            Variant::RelationalNormal | Variant::GraphNormal => Schema::Normal,
            Variant::RelationalOptimized | Variant::GraphOptimized => Schema::Optimized,
        }
    }

    /// Stable label used in files and logs.
    pub fn label(self) -> &'static str {
        match self {
            Variant::RelationalNormal => "relational_normal",
            Variant::RelationalOptimized => "relational_optimized",
            Variant::GraphNormal => "graph_normal",
            Variant::GraphOptimized => "graph_optimized",
        }
    }

    pub(crate) fn ordinal(self) -> u8 {
        match self {
            Variant::RelationalNormal => 0,
            Variant::RelationalOptimized => 1,
            Variant::GraphNormal => 2,
            Variant::GraphOptimized => 3,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Variant::ALL
            .into_iter()
            .find(|variant| variant.label() == s)
            .ok_or_else(|| format!("unknown variant '{s}'"))
    }
}

/// Coarse query category used for aggregate reporting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Ordered scan of a single table / label.
    SimpleRead,
    /// Existence filters and short joins.
    FilteredRead,
    /// Multi-hop joins / traversals.
    JoinRead,
    /// Grouping and aggregation.
    AggregateRead,
    /// Inserts.
    Create,
    /// In-place updates.
    Update,
    /// Deletes.
    Delete,
}

impl Complexity {
    /// Every class in reporting order.
    pub const ALL: [Complexity; 7] = [
        Complexity::SimpleRead,
        Complexity::FilteredRead,
        Complexity::JoinRead,
        Complexity::AggregateRead,
        Complexity::Create,
        Complexity::Update,
        Complexity::Delete,
    ];

    /// Class of a catalog query id; ids are grouped in fixed ranges.
    pub fn of(id: QueryId) -> Complexity {
        match id.get() {
            1..=3 => Complexity::SimpleRead,
            4..=6 => Complexity::FilteredRead,
            7..=9 => Complexity::JoinRead,
            10..=12 => Complexity::AggregateRead,
            13..=16 => Complexity::Create,
            17..=20 => Complexity::Update,
            _ => Complexity::Delete,
        }
    }

    /// True for classes that mutate backend state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Complexity::Create | Complexity::Update | Complexity::Delete
        )
    }

    /// Stable label used in files and logs.
    pub fn label(self) -> &'static str {
        match self {
            Complexity::SimpleRead => "simple_read",
            Complexity::FilteredRead => "filtered_read",
            Complexity::JoinRead => "join_read",
            Complexity::AggregateRead => "aggregate_read",
            Complexity::Create => "create",
            Complexity::Update => "update",
            Complexity::Delete => "delete",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Catalog identifier in `1..=24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct QueryId(u8);

impl QueryId {
    /// Highest catalog id.
    pub const MAX: u8 = 24;

    /// Returns `None` outside `1..=24`.
    pub const fn new(id: u8) -> Option<Self> {
        if id >= 1 && id <= Self::MAX {
            Some(Self(id))
        } else {
            None
        }
    }

    pub(crate) const fn fixed(id: u8) -> Self {
        Self(id)
    }

    /// Raw id.
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for QueryId {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        QueryId::new(value).ok_or_else(|| format!("query id {value} outside 1..=24"))
    }
}

impl From<QueryId> for u8 {
    fn from(value: QueryId) -> Self {
        value.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of one run cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellState {
    /// Not started.
    Pending,
    /// Running discarded warm-up calls.
    Warmup,
    /// Running measured calls.
    Measuring,
    /// All measured calls completed.
    Done,
    /// Stopped early by an unavailable backend or the cell timeout.
    Aborted,
}

impl CellState {
    /// True once the cell can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, CellState::Done | CellState::Aborted)
    }
}

/// Outcome of a single measured call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// The statement completed.
    Ok,
    /// The backend rejected the statement; `duration_ms` is empty.
    QueryError,
}

/// Identity of one run cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    /// Benchmark round, starting at 1.
    pub round: u32,
    /// Dataset tier.
    pub scale: Scale,
    /// Backend combination.
    pub variant: Variant,
    /// Worker count.
    pub concurrency: usize,
    /// Catalog entry.
    pub query_id: QueryId,
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round={} users={} variant={} conc={} query=#{}",
            self.round, self.scale, self.variant, self.concurrency, self.query_id
        )
    }
}

/// One completed, non-warm-up call. Rows are append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Dataset tier.
    pub scale: Scale,
    /// Backend combination.
    pub variant: Variant,
    /// Benchmark round.
    pub round: u32,
    /// Worker count of the cell.
    pub concurrency: usize,
    /// Catalog entry.
    pub query_id: QueryId,
    /// Class of the catalog entry.
    pub complexity: Complexity,
    /// 1-based measured repetition index.
    pub repetition: u32,
    /// Call latency; empty when the call failed.
    pub duration_ms: Option<f64>,
    /// Measuring wall-clock divided by completed calls of the cell.
    pub per_query_ms: Option<f64>,
    /// Completed calls per second over the measuring phase.
    pub qps: Option<f64>,
    /// Average process CPU during the measuring phase, in percent of the machine.
    pub avg_cpu: Option<f64>,
    /// Average resident memory during the measuring phase, in MB.
    pub avg_mem: Option<f64>,
    /// Whether the call succeeded.
    pub status: CallStatus,
    /// Terminal state of the enclosing cell.
    pub cell_state: CellState,
}

impl Measurement {
    /// Cell this row belongs to.
    pub fn cell(&self) -> CellKey {
        CellKey {
            round: self.round,
            scale: self.scale,
            variant: self.variant,
            concurrency: self.concurrency,
            query_id: self.query_id,
        }
    }

    /// Latency of a successful call.
    pub fn latency_ms(&self) -> Option<f64> {
        match self.status {
            CallStatus::Ok => self.duration_ms,
            CallStatus::QueryError => None,
        }
    }
}

/// Ledger row describing how one cell ended.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Dataset tier.
    pub scale: Scale,
    /// Backend combination.
    pub variant: Variant,
    /// Benchmark round.
    pub round: u32,
    /// Worker count.
    pub concurrency: usize,
    /// Catalog entry.
    pub query_id: QueryId,
    /// Class of the catalog entry.
    pub complexity: Complexity,
    /// Terminal state.
    pub state: CellState,
    /// Why the cell was aborted.
    pub abort_reason: Option<String>,
    /// Measurement rows kept.
    pub measured_rows: usize,
    /// Measured calls that raised a query error.
    pub failed_calls: usize,
    /// Warm-up calls that raised a query error.
    pub warmup_failures: usize,
    /// Wall-clock of the whole cell.
    pub wall_ms: f64,
}

impl CellRecord {
    /// Cell this ledger row describes.
    pub fn cell(&self) -> CellKey {
        CellKey {
            round: self.round,
            scale: self.scale,
            variant: self.variant,
            concurrency: self.concurrency,
            query_id: self.query_id,
        }
    }
}
