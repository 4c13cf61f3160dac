use anyhow::{Context, Result};
use clap::Parser;
use ethload_core::{names, tags, Config, LocalSigner, MetricsAggregator, RunSummary, TestRun};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "JSON-RPC load test worker - runs one scenario and writes a result file")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Worker ID (overrides config)
    #[arg(long)]
    worker_id: Option<String>,

    /// Run ID shared by all workers of a run (defaults to a timestamp)
    #[arg(long)]
    run_id: Option<String>,

    /// Print progress every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.apply_env();
    if let Some(worker_id) = args.worker_id {
        config.worker.id = worker_id;
    }
    if let Some(run_id) = args.run_id {
        config.run.id = Some(run_id);
    }
    let worker_id = config.worker.id.clone();

    info!(
        worker = %worker_id,
        scenario = %config.run.scenario,
        endpoints = config.target.http_urls.len(),
        ws_endpoints = config.target.ws_urls.len(),
        wallets = config.wallets.count,
        "starting worker"
    );

    let run = TestRun::new(config, Arc::new(LocalSigner))?;
    info!(run_id = run.context().run_id(), "run created");

    let progress = {
        let metrics = run.context().metrics().clone();
        let every = Duration::from_millis(args.print_every_ms.max(1));
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                print_progress(&metrics, started.elapsed());
            }
        })
    };

    let result = run.run().await;
    progress.abort();
    let summary = result?;

    let output_path = format!("results/worker_{}_{}.json", worker_id, summary.run_id);
    std::fs::create_dir_all("results").context("Failed to create results directory")?;
    let result_json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(&output_path, result_json)
        .with_context(|| format!("Failed to write {output_path}"))?;

    info!("Results written to {}", output_path);
    print_summary(&worker_id, &summary);

    Ok(())
}

fn print_progress(metrics: &MetricsAggregator, elapsed: Duration) {
    let iterations = metrics.sum_matching(&names::ITERATIONS, &[]);
    let failed = metrics.sum_matching(&names::ITERATIONS, &[(tags::OUTCOME, "failure")]);
    let dropped = metrics.sum_matching(&names::DROPPED_ITERATIONS, &[]);
    let requests = metrics.sum_matching(&names::RPC_REQUESTS, &[]);
    let errors = metrics.sum_matching(&names::RPC_ERRORS, &[]);
    let timeouts = metrics.sum_matching(&names::RPC_TIMEOUTS, &[]);
    let vus = metrics.sum_matching(&names::VUS_ACTIVE, &[]);
    let latency = metrics.trend_matching(&names::RPC_LATENCY_MS, &[]);

    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { iterations / secs } else { 0.0 };

    info!(
        "Progress: iterations={} failed={} dropped={} requests={} errors={} timeouts={} vus={} it/s={:.1} p50={:.1}ms p95={:.1}ms p99={:.1}ms",
        iterations,
        failed,
        dropped,
        requests,
        errors,
        timeouts,
        vus,
        rate,
        latency.p50,
        latency.p95,
        latency.p99
    );
}

fn print_summary(worker_id: &str, summary: &RunSummary) {
    println!("\n=== Worker {} Summary ===", worker_id);
    println!("Run: {}", summary.run_id);
    println!("Scenario: {}", summary.scenario);
    println!("Signer: {} / HTTP client: {}", summary.signer, summary.http_client);
    println!("Duration: {}ms", summary.duration_ms);
    println!("Iterations: {}", summary.iterations);
    println!("Failed iterations: {}", summary.failed_iterations);
    println!("Dropped iterations: {}", summary.dropped_iterations);
    println!("Iterations/s: {:.1}", summary.throughput());
    println!("Setup transactions: {}", summary.setup_transactions);
    println!("Drained wallets: {}", summary.drained_wallets);
    if let Some(height) = summary.block_height {
        println!("Block height: {}", height);
    }

    if !summary.calls.is_empty() {
        println!();
        println!(
            "{:<28} {:<5} {:>9} {:>9} {:>7} {:>8} {:>7} {:>9} {:>9}",
            "method", "via", "requests", "success", "errors", "timeouts", "retries", "avg ms", "max ms"
        );
        for call in &summary.calls {
            println!(
                "{:<28} {:<5} {:>9} {:>9} {:>7} {:>8} {:>7} {:>9.1} {:>9.1}",
                call.method,
                call.transport,
                call.requests,
                call.success,
                call.errors,
                call.timeouts,
                call.retries,
                call.latency_avg_ms,
                call.latency_max_ms
            );
        }
    }
    println!();
}
