#![allow(missing_docs)]

use proptest::prelude::*;
use shopbench::aggregate::{aggregate, AnalysisSettings, RowStatus, SummaryRow};
use shopbench::model::{CallStatus, CellState, Complexity, Measurement, QueryId, Scale, Variant};

fn row(variant: Variant, query: u8, repetition: u32, duration_ms: Option<f64>) -> Measurement {
    let query_id = QueryId::new(query).expect("query id");
    Measurement {
        scale: Scale::Users1k,
        variant,
        round: 1,
        concurrency: 3,
        query_id,
        complexity: Complexity::of(query_id),
        repetition,
        duration_ms,
        per_query_ms: Some(1.0),
        qps: Some(1_000.0),
        avg_cpu: Some(12.5),
        avg_mem: Some(64.0),
        status: if duration_ms.is_some() {
            CallStatus::Ok
        } else {
            CallStatus::QueryError
        },
        cell_state: CellState::Done,
    }
}

fn arb_table() -> impl Strategy<Value = Vec<Measurement>> {
    let variant = prop::sample::select(Variant::ALL.to_vec());
    let query = 1u8..=24;
    let duration = prop_oneof![
        9 => (0.001f64..5_000.0).prop_map(Some),
        1 => Just(None),
    ];
    prop::collection::vec((variant, query, duration), 0..120).prop_map(|cells| {
        cells
            .into_iter()
            .enumerate()
            .map(|(i, (variant, query, duration))| row(variant, query, i as u32 + 1, duration))
            .collect()
    })
}

fn all_summaries(report: &shopbench::aggregate::AggregateReport) -> Vec<&SummaryRow> {
    report
        .by_query
        .iter()
        .chain(&report.by_complexity)
        .chain(&report.by_constellation)
        .chain(&report.overall)
        .collect()
}

fn to_csv<T: serde::Serialize>(rows: &[T]) -> Vec<u8> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).expect("serialize");
    }
    writer.into_inner().expect("flush")
}

proptest! {
    #[test]
    fn percentiles_are_ordered_and_intervals_bracket_the_mean(rows in arb_table()) {
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        for summary in all_summaries(&report) {
            match (summary.p50_ms, summary.p99_ms) {
                (Some(p50), Some(p99)) => prop_assert!(p50 <= p99),
                (None, None) => prop_assert_eq!(summary.n, 0),
                other => prop_assert!(false, "mismatched percentiles {:?}", other),
            }
            if let (Some(lo), Some(mean), Some(hi)) =
                (summary.ci_lower_ms, summary.mean_ms, summary.ci_upper_ms)
            {
                let slack = 1e-9 * mean.abs().max(1.0);
                prop_assert!(lo <= mean + slack && mean <= hi + slack);
                prop_assert!(hi - lo >= 0.0);
            }
            if summary.n < 2 {
                prop_assert_eq!(summary.status, RowStatus::InsufficientData);
            }
        }
    }

    #[test]
    fn significance_is_antisymmetric(rows in arb_table()) {
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        let tables = [
            &report.significance_by_query,
            &report.significance_by_complexity,
            &report.significance_by_constellation,
        ];
        for table in tables {
            for ab in table.iter() {
                let ba = table
                    .iter()
                    .find(|r| {
                        r.group == ab.group
                            && r.scale == ab.scale
                            && r.concurrency == ab.concurrency
                            && r.variant_a == ab.variant_b
                            && r.variant_b == ab.variant_a
                    })
                    .expect("mirror row");
                prop_assert_eq!(ab.status, ba.status);
                prop_assert_eq!(ab.p_value, ba.p_value);
                match (ab.statistic, ba.statistic) {
                    (Some(t_ab), Some(t_ba)) => prop_assert!(t_ab == -t_ba),
                    (None, None) => prop_assert!(ab.n_a < 2 || ab.n_b < 2),
                    other => prop_assert!(false, "one-sided statistic {:?}", other),
                }
            }
        }
    }

    #[test]
    fn aggregation_is_byte_identical_across_passes(rows in arb_table()) {
        let settings = AnalysisSettings::default();
        let first = aggregate(&rows, &[], &settings);
        let second = aggregate(&rows, &[], &settings);
        prop_assert_eq!(to_csv(&first.by_query), to_csv(&second.by_query));
        prop_assert_eq!(to_csv(&first.overall), to_csv(&second.overall));
        prop_assert_eq!(
            to_csv(&first.significance_by_complexity),
            to_csv(&second.significance_by_complexity)
        );
        prop_assert_eq!(
            serde_json::to_vec(&first).expect("json"),
            serde_json::to_vec(&second).expect("json")
        );
    }

    #[test]
    fn failed_calls_never_enter_duration_statistics(rows in arb_table()) {
        let report = aggregate(&rows, &[], &AnalysisSettings::default());
        for summary in &report.overall {
            let ok = rows
                .iter()
                .filter(|r| r.variant == summary.variant && r.duration_ms.is_some())
                .count();
            let failed = rows
                .iter()
                .filter(|r| r.variant == summary.variant && r.duration_ms.is_none())
                .count();
            prop_assert_eq!(summary.n, ok);
            prop_assert_eq!(summary.failed_calls, failed);
        }
    }
}

#[test]
fn worked_example_matches_hand_computation() {
    let rows: Vec<_> = [10.0, 20.0, 30.0, 1_000.0]
        .into_iter()
        .enumerate()
        .map(|(i, ms)| row(Variant::GraphNormal, 4, i as u32 + 1, Some(ms)))
        .collect();
    let report = aggregate(&rows, &[], &AnalysisSettings::default());
    let summary = &report.by_query[0];
    assert_eq!(summary.mean_ms, Some(265.0));
    assert_eq!(summary.p50_ms, Some(20.0));
    assert_eq!(summary.p99_ms, Some(1_000.0));
}

#[test]
fn single_samples_leave_the_pair_untested() {
    let rows = vec![
        row(Variant::RelationalNormal, 1, 1, Some(2.0)),
        row(Variant::GraphNormal, 1, 1, Some(3.0)),
    ];
    let report = aggregate(&rows, &[], &AnalysisSettings::default());
    assert_eq!(report.significance_by_query.len(), 2);
    assert!(report
        .significance_by_query
        .iter()
        .all(|r| r.status == RowStatus::InsufficientData && r.p_value.is_none()));
}
