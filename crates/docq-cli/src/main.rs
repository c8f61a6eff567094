use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};
use tracing::{Level, info};

use docq_core::{
    MemoryCollection, Message, MessageHandler, Payload, Queue, QueueConfig, Timestamp,
    WorkerGroup, WorkerOptions,
};

/// Run a worker group against an in-memory queue.
#[derive(Debug, Parser)]
#[command(name = "docq", version)]
struct Args {
    /// JSON queue config; defaults apply to anything it leaves out
    #[arg(long)]
    config: Option<PathBuf>,

    /// Messages to send
    #[arg(long, default_value_t = 20)]
    messages: u32,

    /// Concurrent workers
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Fail the first delivery of every Nth message (0 never fails)
    #[arg(long, default_value_t = 0)]
    fail_every: u32,

    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,
}

#[derive(Debug, Deserialize)]
struct Greeting {
    name: String,
    seq: u32,
}

struct GreetingHandler {
    fail_every: u32,
    failed_once: Mutex<HashSet<u32>>,
    deliveries: AtomicU32,
    handled: AtomicU64,
}

#[async_trait]
impl MessageHandler for GreetingHandler {
    async fn handle(&self, message: &Message) -> Result<(), String> {
        let greeting: Greeting = message
            .payload_as()
            .map_err(|e| format!("json decode: {e}"))?;

        self.deliveries.fetch_add(1, Ordering::Relaxed);
        if self.fail_every > 0
            && greeting.seq % self.fail_every == 0
            && self.failed_once.lock().await.insert(greeting.seq)
        {
            return Err(format!("intentional failure (seq={})", greeting.seq));
        }

        info!(
            id = %message.id(),
            seq = greeting.seq,
            priority = %message.priority(),
            "hello, {}",
            greeting.name
        );
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let config = match &args.config {
        Some(path) => QueueConfig::from_path(path)?,
        None => QueueConfig::default(),
    };
    info!(?config, "starting");

    let queue = Arc::new(Queue::new(Arc::new(MemoryCollection::new())).with_config(&config));
    queue.ensure_get_index(&[], &[]).await?;
    queue.ensure_count_index(&[], true).await?;

    for seq in 0..args.messages {
        let mut payload = Payload::new();
        payload.insert("name".into(), format!("guest-{seq}").into());
        payload.insert("seq".into(), seq.into());
        let priority = f64::from(rand::random::<u8>() % 4);
        queue.send(payload, Timestamp::ZERO, priority).await?;
    }
    info!(messages = args.messages, "messages sent");

    let handler = Arc::new(GreetingHandler {
        fail_every: args.fail_every,
        failed_once: Mutex::new(HashSet::new()),
        deliveries: AtomicU32::new(0),
        handled: AtomicU64::new(0),
    });
    let group = WorkerGroup::spawn(
        args.workers,
        Arc::clone(&queue),
        handler.clone(),
        WorkerOptions::from_config(&config),
    );

    loop {
        let remaining = queue.count(&Payload::new(), None).await?;
        if remaining == 0 {
            break;
        }
        info!(remaining, running = queue.count(&Payload::new(), Some(true)).await?, "waiting");
        sleep(Duration::from_millis(500)).await;
    }
    group.shutdown_and_join().await;

    println!(
        "handled={} deliveries={} remaining={}",
        handler.handled.load(Ordering::Relaxed),
        handler.deliveries.load(Ordering::Relaxed),
        queue.count(&Payload::new(), None).await?
    );
    Ok(())
}
