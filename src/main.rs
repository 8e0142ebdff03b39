//! # Overwatch: task generation, scheduling and bot assignment
//!
//! Usage:
//!   overwatch run                         # Run the demo fleet for 10s
//!   overwatch run --duration-secs 60 -v   # Longer run, debug logging
//!   overwatch config --output cfg.toml    # Write the default config

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use overwatch_bots::{Bot, BotCapability, BotType, TaskBotEngine};
use overwatch_core::OverwatchConfig;
use overwatch_scheduler::{
    BlockingHandler, FnHandler, OverwatchSystem, Task, TaskPriority, TaskResult, TaskType, task_fn,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "overwatch",
    version,
    about = "👁️ Overwatch — task generation, scheduling and bot assignment"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the system with demo handlers and a demo bot fleet
    Run {
        /// Config file (defaults to ~/.overwatch/config.toml)
        #[arg(short, long)]
        config: Option<String>,

        /// How long to run before printing stats
        #[arg(long, default_value = "10")]
        duration_secs: u64,

        /// Number of demo worker bots
        #[arg(long, default_value = "3")]
        bots: usize,
    },
    /// Print the default configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "overwatch=debug,overwatch_scheduler=debug,overwatch_bots=debug"
    } else {
        "overwatch=info,overwatch_scheduler=info,overwatch_bots=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Config { output } => {
            let config = OverwatchConfig::default();
            match output {
                Some(path) => {
                    let path = expand_path(&path);
                    config.save_to(Path::new(&path))?;
                    println!("✅ Default config written to {path}");
                }
                None => print!("{}", config.to_toml()?),
            }
            Ok(())
        }
        Command::Run {
            config,
            duration_secs,
            bots,
        } => run(config, duration_secs, bots).await,
    }
}

async fn run(config_path: Option<String>, duration_secs: u64, bot_count: usize) -> Result<()> {
    let config = match config_path {
        Some(path) => OverwatchConfig::load_from(Path::new(&expand_path(&path)))?,
        None => OverwatchConfig::load()?,
    };

    println!("👁️ Overwatch v{}", env!("CARGO_PKG_VERSION"));
    println!("   ⚙️  Max concurrent tasks: {}", config.scheduler.max_concurrent_tasks);
    println!("   🎯 Strategy:             {}", config.bots.strategy);
    println!("   🤖 Demo bots:            {bot_count}");
    println!("   ⏱️  Duration:             {duration_secs}s");
    println!();

    let system = Arc::new(OverwatchSystem::new(config.clone()));
    register_demo_handlers(&system).await;

    let engine = Arc::new(TaskBotEngine::new(config.bots.clone())?.with_overwatch(system.clone()));
    let mut workers = Vec::new();
    for i in 0..bot_count {
        let bot = Bot::new(&format!("worker-{i}"), &format!("Worker {i}"), BotType::Worker)
            .with_capability(BotCapability::new("user", &[TaskType::UserTask]).with_boost(i as i32))
            .with_capability(BotCapability::new("diagnostics", &[TaskType::Obd2Diagnostic]))
            .with_preference(&[TaskPriority::High, TaskPriority::Normal])
            .with_max_concurrent(2);
        let id = engine.register_bot(bot).await?;
        workers.push(tokio::spawn(simulate_bot(engine.clone(), id)));
    }

    system.start().await;
    engine.start().await;
    let generation = {
        let system = system.clone();
        tokio::spawn(async move { system.run_forever().await })
    };

    for i in 0..5 {
        let priority = if i % 2 == 0 { TaskPriority::High } else { TaskPriority::Normal };
        engine
            .queue_task(Task::new(&format!("user-job-{i}"), "Demo user task", TaskType::UserTask).with_priority(priority))
            .await;
    }
    // No bot declares security scans, so this one goes to the scheduler.
    engine
        .queue_task(Task::new("security-sweep", "Demo security scan", TaskType::SecurityScan))
        .await;
    system
        .create_task(
            "read-dtc",
            "Read trouble codes",
            TaskType::Obd2Diagnostic,
            TaskPriority::High,
            "obd2",
            HashMap::from([("vin".to_string(), serde_json::json!("DEMO0000000000000"))]),
        )
        .await?;

    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    engine.stop().await;
    system.stop().await;
    for worker in workers {
        worker.abort();
    }
    if tokio::time::timeout(config.scheduler.join_timeout(), generation).await.is_err() {
        tracing::warn!("⚠️ Generation loop did not exit in time");
    }

    println!("\n📊 System status:");
    println!("{}", serde_json::to_string_pretty(&system.get_status().await)?);
    println!("\n🤖 Bot engine:");
    println!("{}", serde_json::to_string_pretty(&engine.get_system_stats().await)?);
    for bot in engine.list_bots().await {
        if let Some(stats) = engine.get_bot_stats(&bot.id).await {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn register_demo_handlers(system: &OverwatchSystem) {
    let pool = system.blocking_pool();

    system
        .register_task_handler(
            TaskType::SystemHealth,
            Arc::new(BlockingHandler::new("health-check", &[TaskType::SystemHealth], pool.clone(), |_task| {
                let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                Ok(serde_json::json!({ "healthy": true, "cpus": cpus }))
            })),
        )
        .await;

    system
        .register_task_handler(
            TaskType::PerformanceCheck,
            Arc::new(BlockingHandler::new(
                "performance-check",
                &[TaskType::PerformanceCheck],
                pool,
                |_task| {
                    let start = Instant::now();
                    let checksum = (0..2_000_000u64).fold(0u64, |acc, n| acc.wrapping_mul(31).wrapping_add(n));
                    Ok(serde_json::json!({
                        "elapsed_us": start.elapsed().as_micros() as u64,
                        "checksum": checksum,
                    }))
                },
            )),
        )
        .await;

    system
        .register_fallback_handler(Arc::new(FnHandler::new("echo", &[], |task: Task| async move {
            Ok::<_, String>(serde_json::json!({ "echo": task.name, "type": task.task_type.as_str() }))
        })))
        .await;

    system
        .register_subsystem_handler(
            "obd2",
            task_fn(|task: Task| async move {
                let vin = task
                    .context
                    .metadata
                    .get("vin")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing vin".to_string())?
                    .to_string();
                Ok::<_, String>(serde_json::json!({ "vin": vin, "codes": [] }))
            }),
        )
        .await;
}

/// Demo worker: heartbeats, starts its pending assignments and completes them.
async fn simulate_bot(engine: Arc<TaskBotEngine>, bot_id: String) {
    loop {
        if engine.heartbeat(&bot_id).await.is_err() {
            return;
        }
        for assignment in engine.active_assignments(&bot_id).await {
            if engine.start_assignment(&assignment.id).await.is_err() {
                continue;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            let start = assignment.assigned_at;
            let result = TaskResult::success(
                &assignment.task_id,
                serde_json::json!({ "bot": bot_id, "task": assignment.task.name }),
                start,
            );
            if let Err(e) = engine.complete_assignment(&assignment.id, result).await {
                tracing::warn!("⚠️ {} could not complete {}: {}", bot_id, assignment.id, e);
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
