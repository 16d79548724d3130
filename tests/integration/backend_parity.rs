#![allow(missing_docs)]

use shopbench::backend::{Backend, BackendOpener, EmbeddedBackends, RelationalOptions};
use shopbench::catalog::{self, ParamKey, QueryParams};
use shopbench::dataset::Dataset;
use shopbench::model::{Complexity, QueryId, Scale, Variant};
use tempfile::TempDir;

const SEED: u64 = 11;

fn open_all(dataset: &Dataset, dir: &TempDir) -> Vec<(Variant, Box<dyn Backend>)> {
    let opener = EmbeddedBackends::new(RelationalOptions {
        dir: Some(dir.path().to_path_buf()),
        pool_size: 2,
        ..RelationalOptions::default()
    });
    Variant::ALL
        .iter()
        .map(|&variant| {
            let backend = opener.open(variant, dataset).expect("open backend");
            backend.connect().expect("connect");
            (variant, backend)
        })
        .collect()
}

#[test]
fn read_queries_agree_across_variants() {
    let dataset = Dataset::generate(Scale::Users1k, SEED);
    let dir = TempDir::new().expect("tempdir");
    let backends = open_all(&dataset, &dir);

    for def in catalog::entries().iter().filter(|d| !d.complexity.is_write()) {
        let counts: Vec<(Variant, usize)> = backends
            .iter()
            .map(|(variant, backend)| {
                let exec = backend
                    .execute(def, &QueryParams::empty())
                    .unwrap_or_else(|err| panic!("{variant} query {}: {err}", def.id));
                (*variant, exec.summary.rows)
            })
            .collect();
        let expected = counts[0].1;
        assert!(expected > 0, "query {} returned nothing", def.id);
        for (variant, rows) in &counts {
            assert_eq!(*rows, expected, "query {} on {variant}: {counts:?}", def.id);
        }
    }

    for (_, backend) in &backends {
        backend.close();
    }
}

#[test]
fn write_queries_touch_one_row_everywhere() {
    let dataset = Dataset::generate(Scale::Users1k, SEED);
    let bounds = dataset.bounds();
    let dir = TempDir::new().expect("tempdir");
    let backends = open_all(&dataset, &dir);

    for def in catalog::entries().iter().filter(|d| d.complexity.is_write()) {
        for (variant, backend) in &backends {
            for repetition in 0..3 {
                let params = def.bind(
                    ParamKey {
                        seed: SEED,
                        scale: Scale::Users1k,
                        variant: *variant,
                        query_id: def.id,
                        repetition,
                    },
                    &bounds,
                );
                let exec = backend
                    .execute(def, &params)
                    .unwrap_or_else(|err| panic!("{variant} query {}: {err}", def.id));
                assert_eq!(exec.summary.rows, 1, "{variant} query {}", def.id);
            }
        }
    }
}

#[test]
fn deletes_remove_the_oldest_row_until_empty_tables_return_nothing() {
    let dataset = Dataset::generate_at(5, SEED, 1_700_000_000);
    let dir = TempDir::new().expect("tempdir");
    let backends = open_all(&dataset, &dir);
    let delete_address = catalog::lookup(QueryId::new(21).expect("id"));
    assert_eq!(delete_address.complexity, Complexity::Delete);

    for (variant, backend) in &backends {
        let mut removed = 0;
        for _ in 0..dataset.addresses.len() + 2 {
            removed += backend
                .execute(delete_address, &QueryParams::empty())
                .unwrap_or_else(|err| panic!("{variant}: {err}"))
                .summary
                .rows;
        }
        assert_eq!(removed, dataset.addresses.len(), "{variant}");
    }
}

#[test]
fn closed_backends_are_unavailable() {
    let dataset = Dataset::generate_at(20, SEED, 1_700_000_000);
    let dir = TempDir::new().expect("tempdir");
    let q1 = catalog::lookup(QueryId::new(1).expect("id"));
    for (variant, backend) in open_all(&dataset, &dir) {
        backend.close();
        let err = backend
            .execute(q1, &QueryParams::empty())
            .expect_err("closed backend executed");
        assert!(err.is_unavailable(), "{variant}: {err}");
    }
}
