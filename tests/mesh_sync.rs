use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use phasor_mesh::network::{LocalRelayHub, SocketTransport};
use phasor_mesh::sync::ClockEvent;
use phasor_mesh::time::SystemClock;
use phasor_mesh::{Config, Node, NodeEvent, PeerId, Role};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RUN_FOR: Duration = Duration::from_secs(4);

async fn start(
    hub: &LocalRelayHub,
    id: &str,
    role: Role,
) -> (tokio::sync::broadcast::Receiver<NodeEvent>, JoinHandle<()>) {
    let peer_id = PeerId::new(id);
    let (transport, links) = SocketTransport::bind(peer_id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST))
        .await
        .unwrap();
    let (relay, signals) = hub.endpoint();

    let mut config = Config::new(peer_id, role, "it");
    config.election_window = Duration::from_millis(200);
    config.heartbeat_interval = Duration::from_millis(100);
    let mut node = Node::new(config, transport, relay, Arc::new(SystemClock)).unwrap();
    let events = node.subscribe();

    let handle = tokio::spawn(async move {
        node.run(links, signals, tokio::time::sleep(RUN_FOR))
            .await
            .unwrap();
    });
    (events, handle)
}

/// Waits for the first event matching `pred`
async fn wait_for(
    events: &mut tokio::sync::broadcast::Receiver<NodeEvent>,
    pred: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("node stopped before the event arrived"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_performer_follows_conductor_over_sockets() {
    let hub = LocalRelayHub::new();
    let (mut conductor_events, conductor) = start(&hub, "conductor", Role::Conductor).await;
    let (mut performer_events, performer) = start(&hub, "performer", Role::Performer).await;

    let connected = wait_for(&mut performer_events, |e| {
        matches!(e, NodeEvent::PeerConnected { .. })
    })
    .await;
    assert_eq!(
        connected,
        NodeEvent::PeerConnected {
            peer: PeerId::new("conductor"),
            role: Role::Conductor
        }
    );

    wait_for(&mut conductor_events, |e| {
        matches!(e, NodeEvent::LeaderElected { is_self: true, .. })
    })
    .await;
    let elected = wait_for(&mut performer_events, |e| {
        matches!(e, NodeEvent::LeaderElected { .. })
    })
    .await;
    assert_eq!(
        elected,
        NodeEvent::LeaderElected {
            leader: PeerId::new("conductor"),
            is_self: false
        }
    );

    let update = wait_for(&mut performer_events, |e| {
        matches!(e, NodeEvent::Clock(ClockEvent::SyncUpdate { .. }))
    })
    .await;
    let NodeEvent::Clock(ClockEvent::SyncUpdate { phase, cycle_freq, confidence, .. }) = update else {
        unreachable!();
    };
    assert!((0.0..1.0).contains(&phase));
    assert!((cycle_freq - 0.5).abs() < 1e-9);
    assert!(confidence > 0.0);

    conductor.await.unwrap();
    performer.await.unwrap();
    assert_eq!(hub.members("it"), 0);
}
