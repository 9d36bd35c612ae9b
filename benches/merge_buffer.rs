use chrono::{TimeDelta, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::time::Duration;
use weather_ingest::{
    normalize, Flusher, FlushThreshold, MemoryStore, MergeBuffer, Metric, Observation,
    PayloadShape,
};

fn weekly_window(week: i64) -> Vec<Observation> {
    let anchor = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap() - TimeDelta::weeks(week);
    (0..=7 * 24)
        .map(|h| {
            let ts = anchor - TimeDelta::hours(h);
            Observation::new(Metric::Temperature, ts, (h % 24) as f64 * 0.5)
        })
        .collect()
}

fn bench_merge_buffer(c: &mut Criterion) {
    let windows: Vec<Vec<Observation>> = (0..4).map(weekly_window).collect();

    c.bench_function("insert_4_overlapping_windows", |b| {
        b.iter(|| {
            let mut buffer = MergeBuffer::new(FlushThreshold::default());
            for window in &windows {
                buffer.insert(Metric::Temperature, black_box(window.iter().copied()));
            }
            buffer.snapshot(Metric::Temperature)
        })
    });

    let records: Vec<_> = windows[0]
        .iter()
        .map(|o| json!({"t": o.timestamp.timestamp_millis(), "v": o.value}))
        .collect();
    let payload = json!(records);
    let shape = PayloadShape::Records {
        container: None,
        time_field: "t".to_string(),
        value_field: "v".to_string(),
    };
    c.bench_function("normalize_weekly_records", |b| {
        b.iter(|| normalize(black_box(&payload), Metric::Temperature, &shape))
    });

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let flusher = Flusher::new(MemoryStore::new(), 0, Duration::ZERO);
    let (windows, flusher) = (&windows, &flusher);
    c.bench_function("flush_4_windows_to_memory", |b| {
        b.to_async(&runtime).iter(|| async move {
            let mut buffer = MergeBuffer::new(FlushThreshold::default());
            for window in &windows {
                buffer.insert(Metric::Temperature, window.iter().copied());
            }
            flusher.flush(&mut buffer, Metric::Temperature).await
        })
    });
}

criterion_group!(benches, bench_merge_buffer);
criterion_main!(benches);
