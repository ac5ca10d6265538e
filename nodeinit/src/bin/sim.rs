//! Drives the engine against a simulated mesh.
//!
//! Includes a batch of nodes over a lossy in-process channel, waits for
//! them to settle, optionally heals the network, and prints a summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nodeinit::transport::{MeshProfile, NodeProfile, SimulatedMesh};
use nodeinit::{NodeId, NodeMode, NodeRuntime, RetryPolicy, RuntimeOptions, Stage};
use nodeinit_shared::frame::command_class;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate node initialization over a lossy mesh")]
struct SimArgs {
    /// Number of nodes to include, numbered from 2
    #[arg(long, default_value_t = 8)]
    nodes: u16,

    /// Probability that a routed frame is lost
    #[arg(long, default_value_t = 0.1)]
    loss: f64,

    /// Probability that a routed frame gets a busy reply
    #[arg(long, default_value_t = 0.05)]
    busy: f64,

    #[arg(long, default_value_t = 5)]
    min_latency_ms: u64,

    #[arg(long, default_value_t = 40)]
    max_latency_ms: u64,

    /// Routed request timeout
    #[arg(long, default_value_t = 200)]
    timeout_ms: u64,

    /// Node ids that never answer routed requests
    #[arg(long, value_delimiter = ',')]
    unreachable: Vec<u16>,

    /// Heal the network once every node has settled
    #[arg(long)]
    heal: bool,

    /// JSON options file; command-line values override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Keep static data in `<home>/db` and resume known nodes on start
    #[arg(long)]
    persist: bool,

    /// Home directory for logs and the database
    #[arg(long)]
    home: Option<PathBuf>,
}

fn build_options(args: &SimArgs) -> anyhow::Result<RuntimeOptions> {
    let mut options = match &args.config {
        Some(path) => RuntimeOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeOptions::default(),
    };

    if let Some(home) = &args.home {
        options.home_dir = home.clone();
    } else if args.config.is_none() {
        options.home_dir = std::env::temp_dir().join("nodeinit-sim");
    }
    options.ephemeral = !args.persist;
    options.scheduler.timeouts.routed_ms = args.timeout_ms;
    options.scheduler.timeouts.local_ms = args.timeout_ms.min(options.scheduler.timeouts.local_ms);
    options.scheduler.retry = RetryPolicy {
        base_ms: 50,
        max_ms: 1_000,
        ..RetryPolicy::default()
    };

    Ok(options.sanitize()?)
}

fn build_mesh(args: &SimArgs) -> SimulatedMesh {
    let mesh = SimulatedMesh::new(MeshProfile {
        loss_rate: args.loss,
        busy_rate: args.busy,
        min_latency_ms: args.min_latency_ms,
        max_latency_ms: args.max_latency_ms,
    });

    for id in 2..2 + args.nodes {
        let mut profile = NodeProfile {
            neighbors: vec![1, id.saturating_sub(1).max(1), id + 1],
            reachable: !args.unreachable.contains(&id),
            ..NodeProfile::default()
        };
        if id % 3 == 0 {
            profile.command_classes.push(command_class::MULTI_CHANNEL);
            profile.endpoints = 2;
        }
        if id % 4 == 0 {
            profile.command_classes.push(command_class::SECURITY);
        }
        mesh.add_node(NodeId::new(id), profile);
    }
    mesh
}

fn print_nodes(runtime: &NodeRuntime) {
    println!(
        "{:>5}  {:<13} {:<15} {:>6}  details",
        "node", "mode", "stage", "static"
    );
    for snapshot in runtime.list() {
        let detail = match snapshot.mode {
            NodeMode::Failed => snapshot.failure.clone().unwrap_or_default(),
            _ if !snapshot.heal_failures.is_empty() => format!(
                "heal skipped: {}",
                snapshot
                    .heal_failures
                    .iter()
                    .map(Stage::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            _ => String::new(),
        };
        println!(
            "{:>5}  {:<13} {:<15} {:>6}  {}",
            snapshot.node_id,
            snapshot.mode.as_str(),
            snapshot.stage.as_str(),
            snapshot.static_stages.len(),
            detail
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SimArgs::parse();
    let options = build_options(&args)?;
    nodeinit::init_logging_with_console(&options.home_dir)?;

    let mesh = Arc::new(build_mesh(&args));
    let runtime = NodeRuntime::new(options, mesh.clone())?;
    tracing::info!(nodes = args.nodes, loss = args.loss, "Simulation starting");

    let recovered = runtime.recover_nodes()?;
    for (node_id, stage) in &recovered {
        println!("resumed node {} at {}", node_id, stage);
    }
    for id in 2..2 + args.nodes {
        let node_id = NodeId::new(id);
        if recovered.iter().any(|(recovered, _)| *recovered == node_id) {
            continue;
        }
        runtime.include_node(node_id)?;
    }

    for (node_id, result) in runtime.wait_all_settled().await {
        if let Err(e) = result {
            tracing::warn!(node_id = %node_id, error = %e, "Node did not settle");
        }
    }
    println!("== inclusion ==");
    print_nodes(&runtime);

    if args.heal {
        let started = runtime.heal_network().await;
        runtime.wait_all_settled().await;
        println!("== heal ({} nodes) ==", started.len());
        print_nodes(&runtime);
    }

    if let Some(first) = runtime.list().first() {
        let info = runtime.info(first.node_id)?;
        if let Some(record) = &info.record {
            println!(
                "node {}: heals={} ready_at={:?}",
                record.node_id, record.heal_count, record.ready_at
            );
        }
    }

    println!("frames sent: {}", mesh.frames_sent());
    let lifeline = mesh.group_members(NodeId::new(2), 1);
    println!(
        "node 2 lifeline: {}",
        hex::encode(
            lifeline
                .iter()
                .flat_map(|n| n.get().to_be_bytes())
                .collect::<Vec<u8>>()
        )
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&runtime.metrics().snapshot())?
    );

    runtime.shutdown().await;
    Ok(())
}
