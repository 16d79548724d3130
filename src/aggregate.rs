//! Reduction of the measurement table into summary and significance tables.
//!
//! [`aggregate`] is a pure function: it reads only its arguments, walks
//! groups in key order and serialises floats at a fixed precision, so two
//! passes over the same rows produce byte-identical tables.
//!
//! The cell ledger is folded in alongside the rows. An aborted cell that
//! produced no rows still opens its groups, which then carry `n = 0`, the
//! aborted cell count and [`RowStatus::Aborted`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};

use crate::model::{
    CellKey, CellRecord, CellState, Complexity, Measurement, QueryId, Scale, Variant,
};
use crate::stats;

/// Parameters of an aggregation pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalysisSettings {
    /// Confidence level of the mean intervals.
    pub confidence: f64,
    /// Significance threshold for the pairwise tests.
    pub alpha: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            confidence: 0.95,
            alpha: 0.05,
        }
    }
}

/// What a group is keyed on below `(scale, concurrency, variant)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// A single catalog entry.
    Query(QueryId),
    /// A complexity class.
    Complexity(Complexity),
    /// Every query.
    All,
}

impl Scope {
    /// Label written to the `group` column.
    pub fn label(&self) -> String {
        match self {
            Scope::Query(id) => format!("q{:02}", id.get()),
            Scope::Complexity(class) => class.label().to_string(),
            Scope::All => "ALL".to_string(),
        }
    }
}

/// Grouping key of a summary row. `None` scale or concurrency means pooled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    /// Dataset tier, or every tier.
    pub scale: Option<Scale>,
    /// Worker count, or every level.
    pub concurrency: Option<usize>,
    /// Backend combination.
    pub variant: Variant,
    /// Query, class or everything.
    pub scope: Scope,
}

/// Whether a derived row carries real statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    /// Enough samples.
    Ok,
    /// Fewer than two samples; interval or test not computed.
    InsufficientData,
    /// No successful call and at least one aborted cell.
    Aborted,
}

/// One row of a summary table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SummaryRow {
    /// Dataset tier or `ALL`.
    #[serde(serialize_with = "pooled")]
    pub scale: Option<Scale>,
    /// Worker count or `ALL`.
    #[serde(serialize_with = "pooled")]
    pub concurrency: Option<usize>,
    /// Backend combination.
    pub variant: Variant,
    /// Query, class or `ALL`.
    #[serde(serialize_with = "scope_label")]
    pub group: Scope,
    /// Successful calls.
    pub n: usize,
    /// Calls that raised a query error.
    pub failed_calls: usize,
    /// Distinct aborted cells contributing rows.
    pub aborted_cells: usize,
    /// Mean latency.
    #[serde(serialize_with = "fixed")]
    pub mean_ms: Option<f64>,
    /// Latency standard deviation.
    #[serde(serialize_with = "fixed")]
    pub std_ms: Option<f64>,
    /// Latency variance.
    #[serde(serialize_with = "fixed")]
    pub var_ms: Option<f64>,
    /// Lower bound of the mean interval.
    #[serde(serialize_with = "fixed")]
    pub ci_lower_ms: Option<f64>,
    /// Upper bound of the mean interval.
    #[serde(serialize_with = "fixed")]
    pub ci_upper_ms: Option<f64>,
    /// Median latency.
    #[serde(serialize_with = "fixed")]
    pub p50_ms: Option<f64>,
    /// 99th percentile latency.
    #[serde(serialize_with = "fixed")]
    pub p99_ms: Option<f64>,
    /// Mean throughput.
    #[serde(serialize_with = "fixed")]
    pub mean_qps: Option<f64>,
    /// Mean CPU percent.
    #[serde(serialize_with = "fixed")]
    pub mean_cpu: Option<f64>,
    /// Mean memory in MB.
    #[serde(serialize_with = "fixed")]
    pub mean_mem: Option<f64>,
    /// Whether the interval is meaningful.
    pub status: RowStatus,
}

/// One pairwise comparison.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SignificanceRow {
    /// Dataset tier.
    #[serde(serialize_with = "pooled")]
    pub scale: Option<Scale>,
    /// Worker count.
    #[serde(serialize_with = "pooled")]
    pub concurrency: Option<usize>,
    /// Query, class or `ALL`.
    #[serde(serialize_with = "scope_label")]
    pub group: Scope,
    /// First variant.
    pub variant_a: Variant,
    /// Second variant.
    pub variant_b: Variant,
    /// Samples of the first variant.
    pub n_a: usize,
    /// Samples of the second variant.
    pub n_b: usize,
    /// Welch t statistic of a against b.
    #[serde(serialize_with = "fixed")]
    pub statistic: Option<f64>,
    /// Welch–Satterthwaite degrees of freedom.
    #[serde(serialize_with = "fixed")]
    pub df: Option<f64>,
    /// Two-sided p-value.
    #[serde(serialize_with = "fixed")]
    pub p_value: Option<f64>,
    /// `p_value < alpha`.
    pub significant: Option<bool>,
    /// Whether the test ran.
    pub status: RowStatus,
}

/// Every derived table of one pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateReport {
    /// Per `(scale, concurrency, variant, query)`.
    pub by_query: Vec<SummaryRow>,
    /// Per `(scale, concurrency, variant, complexity)`.
    pub by_complexity: Vec<SummaryRow>,
    /// Per `(scale, concurrency, variant)`.
    pub by_constellation: Vec<SummaryRow>,
    /// One pooled row per variant.
    pub overall: Vec<SummaryRow>,
    /// Variant pairs per query.
    pub significance_by_query: Vec<SignificanceRow>,
    /// Variant pairs per complexity class.
    pub significance_by_complexity: Vec<SignificanceRow>,
    /// Variant pairs per constellation.
    pub significance_by_constellation: Vec<SignificanceRow>,
}

#[derive(Default)]
struct Accumulator {
    durations: Vec<f64>,
    failed: usize,
    aborted: BTreeSet<CellKey>,
    qps: Vec<f64>,
    cpu: Vec<f64>,
    mem: Vec<f64>,
}

impl Accumulator {
    fn push(&mut self, row: &Measurement) {
        match row.latency_ms() {
            Some(ms) => self.durations.push(ms),
            None => self.failed += 1,
        }
        if row.cell_state == CellState::Aborted {
            self.aborted.insert(row.cell());
        }
        self.qps.extend(row.qps);
        self.cpu.extend(row.avg_cpu);
        self.mem.extend(row.avg_mem);
    }

    fn aborted_without_data(&self) -> bool {
        self.durations.is_empty() && !self.aborted.is_empty()
    }

    fn summarise(&self, key: GroupKey, settings: &AnalysisSettings) -> SummaryRow {
        let sorted = stats::sorted(&self.durations);
        let mean = stats::mean(&self.durations);
        let (ci_lower, ci_upper, status) =
            match stats::confidence_interval(&self.durations, settings.confidence) {
                Ok(ci) => (Some(ci.lower), Some(ci.upper), RowStatus::Ok),
                // zero-width interval at the point estimate, or nothing when empty
                Err(_) if self.aborted_without_data() => (None, None, RowStatus::Aborted),
                Err(_) => (mean, mean, RowStatus::InsufficientData),
            };
        SummaryRow {
            scale: key.scale,
            concurrency: key.concurrency,
            variant: key.variant,
            group: key.scope,
            n: self.durations.len(),
            failed_calls: self.failed,
            aborted_cells: self.aborted.len(),
            mean_ms: mean,
            std_ms: stats::std_dev(&self.durations),
            var_ms: stats::variance(&self.durations),
            ci_lower_ms: ci_lower,
            ci_upper_ms: ci_upper,
            p50_ms: stats::percentile(&sorted, 0.50),
            p99_ms: stats::percentile(&sorted, 0.99),
            mean_qps: stats::mean(&self.qps),
            mean_cpu: stats::mean(&self.cpu),
            mean_mem: stats::mean(&self.mem),
            status,
        }
    }
}

type Groups = BTreeMap<GroupKey, Accumulator>;

#[derive(Default)]
struct Tables {
    by_query: Groups,
    by_complexity: Groups,
    by_constellation: Groups,
    overall: Groups,
}

impl Tables {
    // The four groups a cell contributes to, created on first use.
    fn groups_of(&mut self, cell: &CellKey, complexity: Complexity) -> [&mut Accumulator; 4] {
        let key = |scope| GroupKey {
            scale: Some(cell.scale),
            concurrency: Some(cell.concurrency),
            variant: cell.variant,
            scope,
        };
        let pooled = GroupKey {
            scale: None,
            concurrency: None,
            variant: cell.variant,
            scope: Scope::All,
        };
        [
            self.by_query.entry(key(Scope::Query(cell.query_id))).or_default(),
            self.by_complexity
                .entry(key(Scope::Complexity(complexity)))
                .or_default(),
            self.by_constellation.entry(key(Scope::All)).or_default(),
            self.overall.entry(pooled).or_default(),
        ]
    }
}

/// Reduces the full measurement table and the cell ledger into every
/// derived table.
pub fn aggregate(
    rows: &[Measurement],
    cells: &[CellRecord],
    settings: &AnalysisSettings,
) -> AggregateReport {
    let mut tables = Tables::default();
    for row in rows {
        for acc in tables.groups_of(&row.cell(), row.complexity) {
            acc.push(row);
        }
    }
    for record in cells.iter().filter(|c| c.state == CellState::Aborted) {
        let cell = record.cell();
        for acc in tables.groups_of(&cell, record.complexity) {
            acc.aborted.insert(cell);
        }
    }

    AggregateReport {
        by_query: summarise(&tables.by_query, settings),
        by_complexity: summarise(&tables.by_complexity, settings),
        by_constellation: summarise(&tables.by_constellation, settings),
        overall: summarise(&tables.overall, settings),
        significance_by_query: significance(&tables.by_query, settings),
        significance_by_complexity: significance(&tables.by_complexity, settings),
        significance_by_constellation: significance(&tables.by_constellation, settings),
    }
}

fn summarise(groups: &Groups, settings: &AnalysisSettings) -> Vec<SummaryRow> {
    groups
        .iter()
        .map(|(key, acc)| acc.summarise(*key, settings))
        .collect()
}

// Every ordered pair of variants that share (scale, concurrency, scope).
fn significance(groups: &Groups, settings: &AnalysisSettings) -> Vec<SignificanceRow> {
    let mut shared: BTreeMap<(Option<Scale>, Option<usize>, Scope), Vec<(Variant, &Accumulator)>> =
        BTreeMap::new();
    for (key, acc) in groups {
        shared
            .entry((key.scale, key.concurrency, key.scope))
            .or_default()
            .push((key.variant, acc));
    }

    let mut out = Vec::new();
    for ((scale, concurrency, scope), variants) in shared {
        for (variant_a, a) in &variants {
            for (variant_b, b) in &variants {
                if variant_a == variant_b {
                    continue;
                }
                let mut row = SignificanceRow {
                    scale,
                    concurrency,
                    group: scope,
                    variant_a: *variant_a,
                    variant_b: *variant_b,
                    n_a: a.durations.len(),
                    n_b: b.durations.len(),
                    statistic: None,
                    df: None,
                    p_value: None,
                    significant: None,
                    status: if a.aborted_without_data() || b.aborted_without_data() {
                        RowStatus::Aborted
                    } else {
                        RowStatus::InsufficientData
                    },
                };
                if let Ok(test) = stats::welch_t_test(&a.durations, &b.durations) {
                    row.statistic = Some(test.statistic);
                    row.df = Some(test.df);
                    row.p_value = Some(test.p_value);
                    row.significant = Some(test.p_value < settings.alpha);
                    row.status = RowStatus::Ok;
                }
                out.push(row);
            }
        }
    }
    out
}

fn fixed<S: Serializer>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&format!("{v:.6}")),
        None => serializer.serialize_none(),
    }
}

fn pooled<T: ToString, S: Serializer>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.serialize_str(&v.to_string()),
        None => serializer.serialize_str("ALL"),
    }
}

fn scope_label<S: Serializer>(scope: &Scope, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&scope.label())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallStatus;

    fn row(variant: Variant, query: u8, ms: Option<f64>) -> Measurement {
        let query_id = QueryId::new(query).unwrap();
        Measurement {
            scale: Scale::Users1k,
            variant,
            round: 1,
            concurrency: 1,
            query_id,
            complexity: Complexity::of(query_id),
            repetition: 1,
            duration_ms: ms,
            per_query_ms: Some(1.0),
            qps: Some(100.0),
            avg_cpu: Some(10.0),
            avg_mem: None,
            status: if ms.is_some() {
                CallStatus::Ok
            } else {
                CallStatus::QueryError
            },
            cell_state: CellState::Done,
        }
    }

    #[test]
    fn skewed_query_summary() {
        let rows: Vec<_> = [10.0, 20.0, 30.0, 1000.0]
            .into_iter()
            .map(|ms| row(Variant::RelationalNormal, 1, Some(ms)))
            .collect();
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        assert_eq!(report.by_query.len(), 1);
        let q = &report.by_query[0];
        assert_eq!(q.mean_ms, Some(265.0));
        assert_eq!(q.p50_ms, Some(20.0));
        assert_eq!(q.p99_ms, Some(1000.0));
        assert_eq!(q.status, RowStatus::Ok);
        assert!(q.ci_lower_ms.unwrap() <= 265.0 && q.ci_upper_ms.unwrap() >= 265.0);
        assert_eq!(q.mean_mem, None);
        assert_eq!(report.overall.len(), 1);
        assert_eq!(report.overall[0].scale, None);
    }

    #[test]
    fn single_sample_pairs_are_insufficient() {
        let rows = vec![
            row(Variant::RelationalNormal, 4, Some(3.0)),
            row(Variant::GraphNormal, 4, Some(5.0)),
        ];
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        assert_eq!(report.significance_by_query.len(), 2);
        for pair in &report.significance_by_query {
            assert_eq!(pair.status, RowStatus::InsufficientData);
            assert_eq!(pair.p_value, None);
        }
        let summary = &report.by_query[0];
        assert_eq!(summary.status, RowStatus::InsufficientData);
        assert_eq!(summary.ci_lower_ms, summary.mean_ms);
        assert_eq!(summary.ci_upper_ms, summary.mean_ms);
    }

    #[test]
    fn failed_calls_are_counted_not_averaged() {
        let rows = vec![
            row(Variant::GraphOptimized, 13, Some(2.0)),
            row(Variant::GraphOptimized, 13, None),
            row(Variant::GraphOptimized, 13, Some(4.0)),
        ];
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        let q = &report.by_query[0];
        assert_eq!(q.n, 2);
        assert_eq!(q.failed_calls, 1);
        assert_eq!(q.mean_ms, Some(3.0));
    }

    #[test]
    fn aborted_cells_are_flagged() {
        let mut aborted = row(Variant::RelationalOptimized, 21, Some(1.0));
        aborted.cell_state = CellState::Aborted;
        let mut second = aborted.clone();
        second.repetition = 2;
        let report = aggregate(&[aborted, second], &[], &AnalysisSettings::default());
        assert_eq!(report.by_query[0].aborted_cells, 1);
        assert_eq!(report.by_complexity[0].group, Scope::Complexity(Complexity::Delete));
    }

    fn aborted_cell(variant: Variant, query: u8, concurrency: usize) -> CellRecord {
        let query_id = QueryId::new(query).unwrap();
        CellRecord {
            scale: Scale::Users1k,
            variant,
            round: 1,
            concurrency,
            query_id,
            complexity: Complexity::of(query_id),
            state: CellState::Aborted,
            abort_reason: Some("backend unavailable: connection refused".into()),
            measured_rows: 0,
            failed_calls: 0,
            warmup_failures: 0,
            wall_ms: 0.0,
        }
    }

    #[test]
    fn aborted_cells_without_rows_still_appear() {
        let rows: Vec<_> = [1.0, 2.0, 3.0]
            .into_iter()
            .map(|ms| row(Variant::RelationalNormal, 5, Some(ms)))
            .collect();
        let cells = vec![
            aborted_cell(Variant::GraphNormal, 5, 1),
            aborted_cell(Variant::GraphNormal, 6, 1),
        ];
        let report = aggregate(&rows, &cells, &AnalysisSettings::default());

        let graph: Vec<_> = report
            .by_query
            .iter()
            .filter(|r| r.variant == Variant::GraphNormal)
            .collect();
        assert_eq!(graph.len(), 2);
        for summary in &graph {
            assert_eq!(summary.n, 0);
            assert_eq!(summary.aborted_cells, 1);
            assert_eq!(summary.status, RowStatus::Aborted);
            assert_eq!(summary.mean_ms, None);
        }
        let overall = report
            .overall
            .iter()
            .find(|r| r.variant == Variant::GraphNormal)
            .unwrap();
        assert_eq!(overall.aborted_cells, 2);
        assert_eq!(overall.status, RowStatus::Aborted);
        assert_eq!(report.by_constellation.len(), 2);

        let pairs: Vec<_> = report
            .significance_by_query
            .iter()
            .filter(|r| r.group == Scope::Query(QueryId::new(5).unwrap()))
            .collect();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.status == RowStatus::Aborted && p.p_value.is_none()));
    }

    #[test]
    fn ledger_does_not_double_count_cells_with_rows() {
        let mut kept = row(Variant::GraphOptimized, 3, Some(4.0));
        kept.cell_state = CellState::Aborted;
        let cells = vec![aborted_cell(Variant::GraphOptimized, 3, 1)];
        let report = aggregate(&[kept], &cells, &AnalysisSettings::default());
        let summary = &report.by_query[0];
        assert_eq!(summary.n, 1);
        assert_eq!(summary.aborted_cells, 1);
        assert_eq!(summary.status, RowStatus::InsufficientData);
    }

    #[test]
    fn pairs_are_ordered_and_antisymmetric() {
        let mut rows = Vec::new();
        for ms in [1.0, 2.0, 3.0, 4.0] {
            rows.push(row(Variant::RelationalNormal, 7, Some(ms)));
            rows.push(row(Variant::GraphOptimized, 7, Some(ms * 3.0 + 20.0)));
        }
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        let pairs = &report.significance_by_query;
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].variant_a, Variant::RelationalNormal);
        assert_eq!(pairs[1].variant_a, Variant::GraphOptimized);
        assert_eq!(pairs[0].statistic.map(|t| -t), pairs[1].statistic);
        assert_eq!(pairs[0].p_value, pairs[1].p_value);
        assert_eq!(pairs[0].significant, Some(true));
        assert_eq!(report.significance_by_constellation.len(), 2);
    }

    #[test]
    fn group_columns_serialise_pooled_levels() {
        let rows = vec![row(Variant::GraphNormal, 11, Some(1.5))];
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        let json = serde_json::to_value(&report.overall[0]).unwrap();
        assert_eq!(json["scale"], "ALL");
        assert_eq!(json["concurrency"], "ALL");
        assert_eq!(json["group"], "ALL");
        assert_eq!(json["mean_ms"], "1.500000");
        let json = serde_json::to_value(&report.by_query[0]).unwrap();
        assert_eq!(json["scale"], "1000");
        assert_eq!(json["group"], "q11");
    }
}
