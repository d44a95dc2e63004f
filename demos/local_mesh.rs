use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use phasor_mesh::network::{LocalRelayHub, SocketTransport};
use phasor_mesh::sync::ClockEvent;
use phasor_mesh::time::SystemClock;
use phasor_mesh::{Config, Node, NodeEvent, PeerId, Role};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

const RUN_FOR: Duration = Duration::from_secs(10);

async fn spawn_node(hub: &LocalRelayHub, id: &str, role: Role) -> phasor_mesh::Result<JoinHandle<()>> {
    let peer_id = PeerId::new(id);
    let (transport, links) =
        SocketTransport::bind(peer_id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST)).await?;
    let (relay, signals) = hub.endpoint();

    let mut config = Config::new(peer_id, role, "demo");
    config.election_window = Duration::from_millis(500);
    let mut node = Node::new(config, transport, relay, Arc::new(SystemClock))?;

    if role == Role::Performer {
        node.schedule_at_phase(
            0.5,
            move |payload, info| {
                println!("{} reached phase {:.3} ({})", payload, info.phase, info.target);
                Ok(())
            },
            serde_json::json!(id),
        )?;
    }

    let mut events = node.subscribe();
    let name = id.to_string();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                NodeEvent::Clock(ClockEvent::PhasorUpdate { .. }) => {}
                NodeEvent::Clock(ClockEvent::SyncUpdate { phase, error, confidence, .. }) => {
                    tracing::debug!(node = %name, phase, error, confidence, "sync");
                }
                NodeEvent::Clock(ClockEvent::CycleStart { cycle }) => {
                    println!("{:>6} cycle {}", name, cycle);
                }
                other => println!("{:>6} {:?}", name, other),
            }
        }
    });

    Ok(tokio::spawn(async move {
        if let Err(e) = node.run(links, signals, tokio::time::sleep(RUN_FOR)).await {
            eprintln!("node failed: {}", e);
        }
    }))
}

#[tokio::main]
async fn main() -> phasor_mesh::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let hub = LocalRelayHub::new();
    let mut handles = vec![spawn_node(&hub, "conductor", Role::Conductor).await?];
    for id in ["perf-a", "perf-b"] {
        handles.push(spawn_node(&hub, id, Role::Performer).await?);
    }

    println!("Running a conductor and two performers for {:?}", RUN_FOR);
    for handle in handles {
        let _ = handle.await;
    }
    println!("Done");
    Ok(())
}
