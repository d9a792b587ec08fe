use anyhow::Context;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stream_cluster::config::ClusterConfig;
use stream_cluster::node::Node;
use stream_cluster::stage::{Handler, StageRegistry, StageSender};
use tokio::io::AsyncRead;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --config <file.json> [--stage <name> [--key <key>] [--input <file>]]",
            args[0]
        );
        eprintln!("Example: {} --config node-a.json", args[0]);
        eprintln!(
            "Example: {} --config node-b.json --stage count --key all --input words.txt",
            args[0]
        );

        std::process::exit(1);
    }

    let mut config_path: Option<String> = None;
    let mut stage: Option<String> = None;
    let mut key: Option<String> = None;
    let mut input: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--config" => config_path = value,
            "--stage" => stage = value,
            "--key" => key = value,
            "--input" => input = value,
            _ => {
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    let config_path = config_path.context("--config is required")?;
    let config = ClusterConfig::from_file(&config_path)?;
    tracing::info!("Starting node {} from {}", config.local_key, config_path);

    // 1. Stages:
    let registry = StageRegistry::new();
    register_demo_stages(&registry);

    // 2. Listeners and peer connections:
    let node = Node::start(config, registry).await?;

    // 3. Spawn stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            stats_node.log_stats();
            for (peer, state) in stats_node.fabric().states() {
                tracing::info!("  - {} {:?}", peer, state);
            }
        }
    });

    // 4. Optional submission:
    if let Some(stage) = stage {
        let source: Box<dyn AsyncRead + Unpin + Send> = match &input {
            Some(path) => Box::new(
                tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening input {}", path))?,
            ),
            None => Box::new(tokio::io::stdin()),
        };

        let mut session = node.run_stream(&stage, key.as_deref(), source).await?;
        tracing::info!("Session {} submitted {} units, waiting for it to end", session.session, session.units);
        session.finished().await?;
        tracing::info!("Session {} finished", session.session);
    }

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// `init` forwards every line to `echo`, which logs it. `count` counts the
/// lines of one key and reports the total when the key ends.
fn register_demo_stages(registry: &StageRegistry) {
    registry.register("init", |_key, send: StageSender| async move {
        Ok(Handler::new(move |data: Value| {
            let send = send.clone();
            async move { send.send("echo", None, data).await.map_err(anyhow::Error::from) }
        }))
    });

    registry.register("echo", |_key, send: StageSender| async move {
        let session = send.session().to_string();
        Ok(Handler::new(move |data: Value| {
            tracing::info!("[{}] echo: {}", session, data);
            async { Ok(()) }
        }))
    });

    registry.register("count", |key: Option<String>, _send| async move {
        let key = key.unwrap_or_default();
        let lines = Arc::new(AtomicUsize::new(0));
        let counted = lines.clone();
        Ok(Handler::new(move |_data: Value| {
            counted.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .with_finish(move || {
            tracing::info!("count[{}] = {}", key, lines.load(Ordering::SeqCst));
            async { Ok(()) }
        }))
    });
}
