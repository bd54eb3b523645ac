//! Performance benchmarks for chartsync-engine

use chartsync_engine::{
    decide_pull, diff, ClinicalRecord, Field, FieldValue, ModifiedClock, PendingWrite,
    RecordQuery, RecordSchema,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn populated_record(id: usize) -> ClinicalRecord {
    let mut r = ClinicalRecord::new(format!("p{id}"), "u1", format!("Bed {id}"), id as i64, 0);
    r.clinical_summary = "72M admitted with septic shock, improving on low-dose norepinephrine".into();
    r.labs = "Na 138 K 4.1 Cr 1.4 Lactate 1.8".into();
    r.systems.neuro = "GCS 15, no focal deficits".into();
    r.systems.respiratory = "HFNC 40L 40%".into();
    r.medications.infusions = r#"[{"drug":"norepinephrine","rate":"0.05"}]"#.into();
    r.modified = 1_000 + id as u64;
    r
}

fn bench_record(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");
    let record = populated_record(1);
    let schema = RecordSchema::clinical();
    let document = record.to_document();

    group.bench_function("validate_document", |b| {
        b.iter(|| schema.validate_document(black_box(&document)))
    });

    group.bench_function("from_document", |b| {
        b.iter(|| ClinicalRecord::from_document(black_box(document.clone())))
    });

    group.bench_function("field_write", |b| {
        let mut r = record.clone();
        let mut clock = ModifiedClock::new();
        let field = Field::parse("systems.renal").unwrap_or(Field::Labs);
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let _ = r.set(field, FieldValue::Text(format!("UOP {n} ml/h")));
            r.touch(field, n);
            r.modified = clock.next(n, r.modified);
        })
    });

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");
    let local = populated_record(1);
    let mut remote = populated_record(1);
    remote.labs = "Na 140".into();
    remote.modified += 10;
    let pending = PendingWrite {
        base_modified: Some(local.modified - 1),
        force: false,
    };

    group.bench_function("decide_pull", |b| {
        b.iter(|| decide_pull(black_box(Some(&local)), black_box(Some(&pending)), &remote))
    });

    group.bench_function("diff", |b| b.iter(|| diff(black_box(&local), black_box(&remote))));

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for size in [100usize, 1_000, 10_000] {
        let records: Vec<_> = (0..size).rev().map(populated_record).collect();
        let query = RecordQuery::for_owner("u1").filter(|r| !r.collapsed);

        group.bench_with_input(BenchmarkId::new("run", size), &records, |b, records| {
            b.iter(|| query.run(black_box(records)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_record, bench_conflicts, bench_query);
criterion_main!(benches);
