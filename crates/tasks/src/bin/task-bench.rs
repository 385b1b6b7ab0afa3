//! task-bench -- drives a synthetic per-frame scene load through the task manager.
//!
//! Each frame, parallel producers submit one chain per asset:
//! `load -> decode -> upload`, where uploads are pinned to the `render`
//! context lane drained on the main thread. The previous frame's resources
//! are released by destruction tasks on the lane that created them.

use std::hint::black_box;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use dream_core::config::load_dotenv;
use dream_core::Config;
use dream_tasks::{
    Affinity, ContextQueue, ExecutionContext, FnDestruction, FnTask, ResourceHandle,
    SchedulerMetrics, TaskError, TaskHandle, TaskManager, WorkerId,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Synthetic frame-loop benchmark for the dream task scheduler.
#[derive(Parser, Debug)]
#[command(name = "task-bench", version, about)]
struct Cli {
    /// Pool size. Overrides the config; 0 = available parallelism.
    #[arg(long)]
    workers: Option<usize>,

    /// Frames to simulate.
    #[arg(long, default_value_t = 120)]
    frames: u32,

    /// Asset chains submitted per frame.
    #[arg(long, default_value_t = 64)]
    assets: u64,

    /// TOML config file. Without it the config is read from the environment.
    #[arg(long, env = "DREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

// ── Workload ────────────────────────────────────────────────────────

const LOAD_UNITS: u64 = 2_000;
const DECODE_UNITS: u64 = 8_000;
const UPLOAD_UNITS: u64 = 500;

/// Stand-in for real work: a short integer hash loop.
fn busy_work(seed: u64, units: u64) -> u64 {
    let mut acc = seed | 1;
    for i in 0..units {
        acc = acc.rotate_left(5) ^ i.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
    acc
}

/// Handles of one asset chain, plus the resources it creates.
struct AssetChain {
    decode: TaskHandle,
    cpu_buffer: ResourceHandle,
    gpu_texture: ResourceHandle,
}

fn submit_asset(
    manager: &TaskManager,
    render: WorkerId,
    frame: u32,
    asset: u64,
    assets: u64,
) -> Result<AssetChain, TaskError> {
    let base = (u64::from(frame) * assets + asset) * 2;
    let cpu_buffer = ResourceHandle(base);
    let gpu_texture = ResourceHandle(base + 1);

    let load = manager.submit(
        FnTask::new("load", move |_: &ExecutionContext| {
            black_box(busy_work(base, LOAD_UNITS));
        }),
        &[],
    )?;
    let decode = manager.submit(
        FnTask::new("decode", move |_: &ExecutionContext| {
            black_box(busy_work(base ^ 0xD, DECODE_UNITS));
        }),
        &[load],
    )?;
    manager.submit_pinned(
        FnTask::new("upload", move |_: &ExecutionContext| {
            black_box(busy_work(base ^ 0xF, UPLOAD_UNITS));
        }),
        &[decode],
        render,
    )?;

    Ok(AssetChain {
        decode,
        cpu_buffer,
        gpu_texture,
    })
}

fn release(
    manager: &TaskManager,
    resources: impl IntoIterator<Item = (ResourceHandle, WorkerId)>,
) -> Result<usize, TaskError> {
    let mut count = 0;
    for (resource, owner) in resources {
        manager.submit_destruction(
            FnDestruction::new("release", resource, |res: ResourceHandle, _: &ExecutionContext| {
                black_box(res);
            }),
            &[],
            Affinity::Worker(owner),
        )?;
        count += 1;
    }
    Ok(count)
}

/// Drain the render lane on this thread until it holds nothing.
fn drain_render(gpu: &ContextQueue) -> Result<usize, TaskError> {
    let mut completed = 0;
    while !gpu.is_idle() {
        let pass = gpu.run_pending()?;
        completed += pass.completed();
        if pass.completed() == 0 {
            thread::yield_now();
        }
    }
    Ok(completed)
}

// ── Summary ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct BenchSummary {
    workers: usize,
    frames: u32,
    assets_per_frame: u64,
    total: Duration,
    avg_frame: Duration,
    max_frame: Duration,
    released: usize,
    metrics: SchedulerMetrics,
}

// ── Main ────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            load_dotenv();
            Config::from_env()
        }
    };
    if let Some(workers) = cli.workers {
        config.tasks.worker_threads = workers;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .init();
    config.log_summary();

    let manager = TaskManager::builder(config.tasks.clone())
        .context("render")
        .build()
        .context("failed to start task manager")?;
    let render = manager
        .context_id("render")
        .context("render context lane missing")?;
    let gpu = manager.context_queue("render")?;

    info!(
        workers = manager.worker_count(),
        frames = cli.frames,
        assets = cli.assets,
        "starting benchmark"
    );

    let mut previous: Vec<(ResourceHandle, WorkerId)> = Vec::new();
    let mut frame_times = Vec::with_capacity(cli.frames as usize);
    let mut released = 0;
    let bench_started = Instant::now();

    for frame in 0..cli.frames {
        let started = Instant::now();

        released += release(&manager, previous.drain(..))?;
        let chains = (0..cli.assets)
            .into_par_iter()
            .map(|asset| submit_asset(&manager, render, frame, asset, cli.assets))
            .collect::<Result<Vec<_>, _>>()?;

        manager.clear_fences();
        manager.wait_for_fence()?;
        let rendered = drain_render(&gpu)?;

        for chain in &chains {
            let decoder = manager
                .task(chain.decode)?
                .worker
                .context("decode task was never pinned")?;
            previous.push((chain.cpu_buffer, decoder));
            previous.push((chain.gpu_texture, render));
        }
        let reclaimed = manager.reclaim_completed();

        let elapsed = started.elapsed();
        frame_times.push(elapsed);
        debug!(frame, rendered, reclaimed, elapsed = ?elapsed, "frame complete");
    }

    // Teardown: the last frame's resources still need releasing.
    released += release(&manager, previous.drain(..))?;
    manager.clear_fences();
    manager.wait_for_fence()?;
    gpu.finish()?;
    manager.shutdown();

    let total = bench_started.elapsed();
    let summary = BenchSummary {
        workers: manager.worker_count(),
        frames: cli.frames,
        assets_per_frame: cli.assets,
        total,
        avg_frame: total / cli.frames.max(1),
        max_frame: frame_times.iter().copied().max().unwrap_or_default(),
        released,
        metrics: manager.metrics(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{} frames x {} assets on {} workers in {:.1?} (avg {:.2?}, max {:.2?})",
            summary.frames,
            summary.assets_per_frame,
            summary.workers,
            summary.total,
            summary.avg_frame,
            summary.max_frame
        );
        let totals = &summary.metrics.totals;
        let mut names: Vec<_> = totals.tasks_executed.iter().collect();
        names.sort();
        for (name, count) in names {
            let avg = totals.avg_task_duration.get(name).copied().unwrap_or_default();
            println!("  {name:<8} {count:>8} runs  avg {avg:.2?}");
        }
        println!(
            "  expired {}  panicked {}  destroyed {}  deferrals {}",
            totals.expired, totals.panicked, totals.destroyed, totals.deferrals
        );
    }
    Ok(())
}
