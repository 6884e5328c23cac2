use anyhow::Result;
use ferry_loader::config::settings::{FerryConfig, Settings};
use ferry_loader::{Car, FerryState, LocalRuntime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const CONVERGENCE: Duration = Duration::from_secs(60);
const MIN: u64 = 3000;
const MAX: u64 = 3200;

fn random_cars(seed: u64, count: usize) -> Vec<Car> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| Car::new(format!("bagbaiera-rand-{:04}", i), rng.gen_range(1..=400)))
        .collect()
}

fn parallel_settings() -> Settings {
    let mut settings = Settings::with_ferry(FerryConfig::new(MIN, MAX));
    settings.car_stream.parallelism = 4;
    settings.car_stream.batch_size = 10;
    settings.car_stream.max_batching_window_ms = 5;
    settings.ferry_stream.parallelism = 3;
    settings.conflict_retry.max_attempts = 20;
    settings.conflict_retry.base_delay_ms = 1;
    settings.conflict_retry.max_delay_ms = 10;
    settings
}

/// Sizes add up, nothing is overloaded, and every ferry that crossed the
/// threshold left LOADING.
fn assert_consistent(runtime: &LocalRuntime, cars: &[Car]) -> Result<()> {
    let store = runtime.store();
    let cargo = store.cargo()?;

    let links: HashSet<&str> = cargo.iter().map(|c| c.link.as_str()).collect();
    assert_eq!(links.len(), cargo.len(), "a car was loaded twice");
    assert_eq!(cargo.len(), cars.len());

    let mut per_ferry: HashMap<_, u64> = HashMap::new();
    for record in &cargo {
        *per_ferry.entry(record.ferry_id.clone()).or_default() += record.size;
    }

    let ferries = store.ferries()?;
    let total: u64 = ferries.iter().map(|f| f.size).sum();
    assert_eq!(total, cars.iter().map(|c| c.size).sum::<u64>());

    for ferry in &ferries {
        assert!(ferry.size <= MAX, "ferry {} overloaded", ferry.id);
        assert_eq!(
            per_ferry.get(&ferry.id).copied().unwrap_or(0),
            ferry.size,
            "ferry {} size drifted from its cargo",
            ferry.id
        );
        match ferry.state {
            FerryState::Ready => assert!(ferry.size >= MIN),
            FerryState::Loading => assert!(ferry.size < MIN),
            other => panic!("unexpected state {} for ferry {}", other, ferry.id),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_consumers_conserve_size() -> Result<()> {
    let runtime = LocalRuntime::start(&parallel_settings());
    let cars = random_cars(42, 300);

    for chunk in cars.chunks(25) {
        runtime.put_cars(chunk).await?;
    }
    runtime.wait_until_idle(CONVERGENCE).await?;

    assert_consistent(&runtime, &cars)?;
    assert!(runtime.summary()?.dead_letters.is_empty());

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replayed_inserts_change_nothing() -> Result<()> {
    let runtime = LocalRuntime::start(&parallel_settings());
    let cars = random_cars(7, 120);

    runtime.put_cars(&cars).await?;
    runtime.wait_until_idle(CONVERGENCE).await?;
    let before = runtime.store().ferries()?;

    let replayed = runtime.store().replay_car_inserts()?;
    assert_eq!(replayed, cars.len());
    runtime.wait_until_idle(CONVERGENCE).await?;

    let after = runtime.store().ferries()?;
    assert_eq!(before, after);
    assert_consistent(&runtime, &cars)?;

    runtime.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_store_outage_is_retried_until_it_recovers() -> Result<()> {
    let mut settings = parallel_settings();
    settings.car_stream.max_record_attempts = 1000;
    let runtime = LocalRuntime::start(&settings);
    let cars = random_cars(3, 20);

    runtime.put_cars(&cars).await?;
    runtime.store().set_unavailable(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.store().set_unavailable(false);
    runtime.wait_until_idle(CONVERGENCE).await?;

    assert_consistent(&runtime, &cars)?;
    assert!(runtime.car_dead_letters().is_empty());

    runtime.shutdown().await;
    Ok(())
}
