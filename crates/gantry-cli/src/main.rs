use std::time::Duration;

use rand::Rng;
use tracing_subscriber::EnvFilter;

use gantry_core::{JoinError, PoolBuilder, RejectionPolicy, ScheduleMode, TaskError};

#[tokio::main]
async fn main() {
    // (A) ログと pool を用意（core 2 / max 4 / queue 8、飽和時は caller-runs）
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pool = PoolBuilder::new()
        .core_size(2)
        .max_size(4)
        .queue_capacity(8)
        .keep_alive(Duration::from_millis(500))
        .rejection(RejectionPolicy::CallerRuns)
        .worker_name_prefix("gantry")
        .build()
        .expect("valid config");

    // (B) core worker を先に起こしておく
    let prestarted = pool.prestart_core_workers();
    println!("prestarted {prestarted} core workers");

    // (C) jitter 付きの仕事を 10 本投げ、完了した順に回収する
    let mut tracker = pool.completion_tracker::<u64>();
    for i in 0..10u64 {
        let ms = rand::thread_rng().gen_range(40..160);
        tracker
            .submit(format!("job-{i}"), move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .await
            .expect("pool accepts the burst");
    }
    tracker.close();
    while let Some(handle) = tracker.take().await {
        match handle.get().await {
            Ok(ms) => println!("done: {} slept {ms}ms", handle.name().unwrap()),
            Err(e) => println!("done: {} -> {e}", handle.name().unwrap()),
        }
    }

    // (D) 100ms の fixed-rate ticker を暫く走らせて止める
    let ticker = pool
        .submit_scheduled_named(
            "ticker",
            Duration::ZERO,
            Duration::from_millis(100),
            ScheduleMode::FixedRate,
            |_ctx| async {
                println!("tick");
                Ok(())
            },
        )
        .expect("pool is running");
    tokio::time::sleep(Duration::from_millis(350)).await;
    ticker.cancel();
    println!("ticker fired {} times", ticker.runs_started());

    // (E) 実行中 task の interrupt cancel を見てから graceful shutdown
    let stubborn = pool
        .submit_named("stubborn", |ctx| async move {
            tokio::select! {
                _ = ctx.cancelled() => Err(TaskError::msg("interrupted")),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(0u64),
            }
        })
        .await
        .expect("pool is running");
    tokio::time::sleep(Duration::from_millis(50)).await;
    stubborn.cancel(true);
    match stubborn.get().await {
        Err(JoinError::Cancelled) => println!("stubborn task cancelled"),
        other => println!("stubborn task ended oddly: {other:?}"),
    }

    println!(
        "snapshot: {}",
        serde_json::to_string_pretty(&pool.snapshot()).unwrap()
    );
    pool.shutdown();
    let clean = pool.await_termination(Duration::from_secs(5)).await;
    println!("terminated cleanly: {clean}");
}
