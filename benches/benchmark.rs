use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{Rgba, RgbaImage};
use pagewatch::compare::{pixelmatch, DiffOptions};
use pagewatch::models::{RetentionSettings, Screenshot, ViewportTag};
use pagewatch::{plan_deletions, Config};

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(std::time::Duration::from_millis(500));
    group.measurement_time(std::time::Duration::from_millis(500));
    group.sample_size(20);
}

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_dsl_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("dsl_validation");
    configure_fast_group(&mut group);

    let document = r##"{
        "steps": [
            {"action": "waitForSelector", "selector": "#login", "timeout": 5000},
            {"action": "type", "selector": "#user", "text": "alice"},
            {"action": "type", "selector": "#password", "text": "hunter2"},
            {"action": "click", "selector": "#submit"},
            {"action": "waitForNavigation", "timeout": 10000},
            {"action": "assertUrl", "pattern": "dashboard"},
            {"action": "assertSelector", "selector": ".welcome", "visible": true},
            {"action": "assertText", "selector": "h1", "text": "Welcome", "contains": true}
        ]
    }"##;

    group.bench_function("validate_8_steps", |b| {
        b.iter(|| {
            let report = pagewatch::dsl::validate(black_box(document), true);
            black_box(report);
        });
    });

    group.finish();
}

fn benchmark_retention_planner(c: &mut Criterion) {
    let mut group = c.benchmark_group("retention_planner");
    configure_fast_group(&mut group);

    let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
    let settings = RetentionSettings {
        max_screenshots_per_page: None,
        max_age_days: None,
        keep_per_day: 4,
        keep_per_week: 2,
        keep_per_month: 1,
        keep_per_year: 1,
    };
    let screenshots: Vec<Screenshot> = (0..500i64)
        .map(|i| Screenshot {
            id: 10_000 - i,
            page_id: 1,
            viewport: ViewportTag::Desktop,
            viewport_width: 1920,
            file_path: Some(format!("1/{i}.png")),
            thumbnail_path: Some(format!("1/{i}_thumb.png")),
            file_size: 1000,
            image_width: 1920,
            image_height: 4000,
            created_at: now - Duration::hours(i * 19),
        })
        .collect();

    group.bench_function("plan_500_screenshots", |b| {
        b.iter(|| {
            let plan = plan_deletions(black_box(&screenshots), &settings, now);
            black_box(plan);
        });
    });

    group.finish();
}

fn benchmark_pixelmatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("pixelmatch");
    configure_fast_group(&mut group);

    let base = RgbaImage::from_pixel(320, 240, Rgba([200, 200, 200, 255]));
    let mut changed = base.clone();
    for y in 40..80 {
        for x in 40..120 {
            changed.put_pixel(x, y, Rgba([30, 30, 30, 255]));
        }
    }

    group.bench_function("stats_only_320x240", |b| {
        b.iter(|| {
            let count = pixelmatch(
                black_box(&base),
                black_box(&changed),
                None,
                &DiffOptions::default(),
            );
            black_box(count);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_config_creation,
    benchmark_dsl_validation,
    benchmark_retention_planner,
    benchmark_pixelmatch
);
criterion_main!(benches);
