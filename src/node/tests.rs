use super::*;
use crate::core::ErrorKind;
use crate::envelope::PREFIX_LEN;
use crate::intent::VersionRange;
use crate::observability::hooks::RecordingHook;
use crate::security::{DidDirectory, SecurityConfig};
use crate::transport::{MemoryNetwork, OverlayBus};
use semver::Version;
use std::time::Duration;

const INTENT: &str = "research:climate-analysis:run@2.1.0";

struct TestNode {
    node: Arc<ProtocolNode>,
    recorder: Arc<RecordingHook>,
    inbound: mpsc::Sender<InboundFrame>,
}

struct Mesh {
    network: MemoryNetwork,
    bus: OverlayBus,
    directory: Arc<DidDirectory>,
}

impl Mesh {
    fn new() -> Self {
        Self {
            network: MemoryNetwork::new(),
            bus: OverlayBus::new(256),
            directory: Arc::new(DidDirectory::new()),
        }
    }

    async fn node(&self, name: &str) -> TestNode {
        self.node_with(name, ProtocolConfig::default()).await
    }

    async fn node_with(&self, name: &str, config: ProtocolConfig) -> TestNode {
        let identity = AgentIdentity::generate();
        self.directory.register(identity.document()).unwrap();
        let recorder = Arc::new(RecordingHook::default());
        let hooks = Hooks::new();
        hooks.register(recorder.clone());

        let resolver: Arc<dyn KeyResolver> = self.directory.clone();
        let builder = ProtocolNode::builder(identity, resolver, config).with_hooks(hooks);
        let inbound = builder.inbound();
        let direct = self.network.bind(name, builder.inbound()).unwrap();
        let overlay = self.bus.join(name, builder.inbound());
        let node = builder
            .with_backend(Arc::new(direct))
            .with_backend(Arc::new(overlay))
            .start()
            .await
            .unwrap();
        TestNode {
            node,
            recorder,
            inbound,
        }
    }
}

fn climate_record() -> CapabilityRecord {
    CapabilityRecord::new("placeholder").with_capability(
        IntentPattern::parse("research:climate-analysis:run").unwrap(),
        VersionRange::new(Version::new(2, 0, 0), Version::new(2, 9, 0)).unwrap(),
    )
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// `server` advertises the climate capability to `client` directly.
async fn introduce(server: &ProtocolNode, client: &ProtocolNode) {
    let to = client.local_endpoints()[0].clone();
    server.advertise(&climate_record(), Some(&to)).await.unwrap();
    let did = server.did().to_string();
    eventually(|| client.registry().snapshot().get(&did).is_some()).await;
}

async fn next(sub: &mut Subscription) -> Arc<Envelope> {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("no delivery in time")
        .expect("delivery log closed")
}

#[tokio::test]
async fn test_advertisement_populates_peer_registry() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;

    let snapshot = a.node.registry().snapshot();
    let record = snapshot.get(b.node.did()).unwrap();
    assert_eq!(record.endpoints, vec![Endpoint::direct("b"), Endpoint::overlay("b")]);
    assert!(b.node.registry().is_empty());
}

#[tokio::test]
async fn test_submit_handshakes_and_delivers() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;
    let mut sub = b.node.subscribe(IntentPattern::parse("research:*").unwrap());

    let envelope = Envelope::request(INTENT, "interactive")
        .unwrap()
        .with_payload(b"{\"region\":\"north-sea\"}".to_vec());
    let cid = envelope.correlation_id();
    let receipt = a.node.submit(envelope).await.unwrap();
    assert_eq!(receipt.correlation_id, cid);
    assert_eq!(receipt.peer, b.node.did());
    assert_eq!(receipt.endpoint, Endpoint::direct("b"));

    let delivered = next(&mut sub).await;
    assert_eq!(delivered.correlation_id(), cid);
    assert_eq!(delivered.trailer.key_id, a.node.did());
    assert_eq!(delivered.payload, b"{\"region\":\"north-sea\"}".to_vec());

    assert!(a.node.security().session_for_peer(b.node.did()).is_some());
    assert!(b.node.security().session_for_peer(a.node.did()).is_some());
    assert_eq!(
        a.recorder.stages(cid),
        vec![
            LifecycleStage::Submitted,
            LifecycleStage::Admitted,
            LifecycleStage::Signed,
            LifecycleStage::Dispatched,
            LifecycleStage::Acknowledged,
        ]
    );
    assert!(a.recorder.counters().contains(&CounterEvent::Sent {
        class: "interactive".into()
    }));

    let record = a.node.registry().snapshot().get(b.node.did()).cloned().unwrap();
    assert!(record.latency_measured);
    assert!(record.trust_score > a.node.config().registry.max_advertised_trust);
}

#[tokio::test]
async fn test_session_is_reused() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;

    a.node.submit(Envelope::request(INTENT, "interactive").unwrap()).await.unwrap();
    let first = a.node.security().session_for_peer(b.node.did()).unwrap();
    a.node.submit(Envelope::request(INTENT, "realtime").unwrap()).await.unwrap();
    assert_eq!(a.node.security().session_for_peer(b.node.did()), Some(first));
    assert_eq!(a.node.security().session_count(), 1);
}

#[tokio::test]
async fn test_unresolvable_intent_fails_once() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;

    let envelope = Envelope::request(INTENT, "interactive").unwrap();
    let cid = envelope.correlation_id();
    let err = a.node.submit(envelope).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoCapableAgent);
    assert_eq!(err.correlation_id(), Some(cid));
    assert_eq!(
        a.recorder.stages(cid),
        vec![LifecycleStage::Submitted, LifecycleStage::Failed]
    );
    let counters = a.recorder.counters();
    assert!(counters.contains(&CounterEvent::ResolutionMiss {
        intent: "research:climate-analysis:run".into()
    }));
    assert!(counters.contains(&CounterEvent::Failed {
        class: "interactive".into(),
        kind: ErrorKind::NoCapableAgent,
    }));
}

#[tokio::test]
async fn test_expired_envelope_is_never_sent() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;
    let mut sub = b.node.subscribe(IntentPattern::parse("research:*").unwrap());

    let stale = Envelope::request(INTENT, "interactive")
        .unwrap()
        .with_timestamp(now_millis() - 60_000);
    let err = a.node.submit(stale).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    assert!(sub.try_recv().is_none());
    assert_eq!(a.node.security().session_count(), 0);
}

#[tokio::test]
async fn test_request_gets_correlated_response() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;

    let responder = b.node.clone();
    let mut sub = responder.subscribe(IntentPattern::parse("research:climate-analysis").unwrap());
    tokio::spawn(async move {
        if let Some(request) = sub.recv().await {
            responder
                .reply(&request, MessageType::Response, b"anomaly: +1.2C".to_vec())
                .await
                .unwrap();
        }
    });

    let request = Envelope::request(INTENT, "interactive").unwrap();
    let cid = request.correlation_id();
    let response = a.node.request(request).await.unwrap();
    assert_eq!(response.correlation_id(), cid);
    assert_eq!(response.message_type(), MessageType::Response);
    assert_eq!(response.trailer.key_id, b.node.did());
    assert_eq!(response.payload, b"anomaly: +1.2C".to_vec());
}

#[tokio::test]
async fn test_request_without_answer_hits_deadline() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;

    let request = Envelope::request(INTENT, "interactive").unwrap().with_ttl(300);
    let err = a.node.request(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
}

#[tokio::test]
async fn test_resume_subscription_after_position() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;
    let pattern = IntentPattern::parse("research:*").unwrap();
    let mut first = b.node.subscribe(pattern.clone());

    let mut sent = Vec::new();
    for _ in 0..3 {
        let envelope = Envelope::request(INTENT, "interactive").unwrap();
        sent.push(envelope.correlation_id());
        a.node.submit(envelope).await.unwrap();
    }

    assert_eq!(next(&mut first).await.correlation_id(), sent[0]);
    let mut resumed = b.node.subscribe_from(pattern, first.position());
    drop(first);
    assert_eq!(next(&mut resumed).await.correlation_id(), sent[1]);
    assert_eq!(next(&mut resumed).await.correlation_id(), sent[2]);
}

#[tokio::test]
async fn test_broadcast_reaches_every_overlay_member() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    let c = mesh.node("c").await;
    let pattern = IntentPattern::parse("research:*").unwrap();
    let mut at_b = b.node.subscribe(pattern.clone());
    let mut at_c = c.node.subscribe(pattern);

    let envelope = Envelope::request(INTENT, "interactive")
        .unwrap()
        .with_flag(EnvelopeFlags::BROADCAST);
    let cid = envelope.correlation_id();
    let receipt = a.node.submit(envelope).await.unwrap();
    assert_eq!(receipt.endpoint.kind, crate::core::TransportKind::Overlay);

    assert_eq!(next(&mut at_b).await.correlation_id(), cid);
    assert_eq!(next(&mut at_c).await.correlation_id(), cid);
    assert_eq!(a.node.security().session_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_refreshes_peer_record() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;

    let observation = CapabilityObservation {
        agent_id: "ignored".into(),
        capacity_headroom: Some(0.25),
        estimated_latency_ms: Some(40.0),
    };
    b.node
        .heartbeat(observation, Some(&Endpoint::direct("a")))
        .await
        .unwrap();
    let did = b.node.did().to_string();
    eventually(|| {
        a.node
            .registry()
            .snapshot()
            .get(&did)
            .map(|r| r.capacity_headroom == 0.25 && r.estimated_latency_ms == 40.0)
            .unwrap_or(false)
    })
    .await;
}

#[tokio::test]
async fn test_close_session_reaches_peer() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let b = mesh.node("b").await;
    introduce(&b.node, &a.node).await;
    a.node.submit(Envelope::request(INTENT, "interactive").unwrap()).await.unwrap();
    let id = a.node.security().session_for_peer(b.node.did()).unwrap();

    a.node.close_session(b.node.did()).await.unwrap();
    assert!(a.node.security().session_for_peer(b.node.did()).is_none());
    eventually(|| b.node.security().session_for_peer(a.node.did()).is_none()).await;
    assert_eq!(
        b.node.security().session_state(id),
        Some(crate::security::SessionState::Closed)
    );
    assert_eq!(
        a.node.close_session(b.node.did()).await.unwrap_err().kind(),
        ErrorKind::InvalidSessionState
    );
}

#[tokio::test]
async fn test_silent_peer_fails_handshake() {
    let mesh = Mesh::new();
    let config = ProtocolConfig {
        security: SecurityConfig {
            handshake_timeout_ms: 200,
            ..SecurityConfig::default()
        },
        ..ProtocolConfig::default()
    };
    let a = mesh.node_with("a", config).await;
    // Bound but never drained.
    let (tx, _silent) = mpsc::channel(8);
    let _ghost = mesh.network.bind("ghost", tx).unwrap();
    let ghost = AgentIdentity::generate();
    let mut record = climate_record().with_endpoint(Endpoint::direct("ghost"));
    record.agent_id = ghost.did().to_string();
    a.node
        .registry()
        .apply_advertisement(CapabilityAdvertisement::from_record(&record), now_millis());

    let err = a
        .node
        .submit(Envelope::request(INTENT, "interactive").unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    assert_eq!(a.node.security().session_count(), 0);
}

#[tokio::test]
async fn test_tampered_frame_is_rejected() {
    let mesh = Mesh::new();
    let a = mesh.node("a").await;
    let mut sub = a.node.subscribe(IntentPattern::parse("research:*").unwrap());

    let sender = AgentIdentity::generate();
    mesh.directory.register(sender.document()).unwrap();
    let resolver: Arc<dyn KeyResolver> = mesh.directory.clone();
    let security = SecurityManager::new(sender, resolver, SecurityConfig::default());
    let sealed = security
        .seal_session_less(
            Envelope::request(INTENT, "interactive")
                .unwrap()
                .with_flag(EnvelopeFlags::BROADCAST),
        )
        .unwrap();

    let mut tampered = sealed.frame.clone();
    tampered[PREFIX_LEN + 2] ^= 0xFF;
    let frame = |bytes: Vec<u8>| InboundFrame {
        kind: crate::core::TransportKind::Overlay,
        from: Some("mallory".into()),
        frame: Bytes::from(bytes),
    };
    a.inbound.send(frame(tampered)).await.unwrap();
    a.inbound.send(frame(sealed.frame.clone())).await.unwrap();
    a.inbound.send(frame(sealed.frame.clone())).await.unwrap();

    assert_eq!(next(&mut sub).await.correlation_id(), sealed.envelope.correlation_id());
    eventually(|| {
        let counters = a.recorder.counters();
        counters.contains(&CounterEvent::InboundRejected {
            kind: ErrorKind::AuthenticationFailed,
        }) && counters.contains(&CounterEvent::InboundRejected {
            kind: ErrorKind::ReplayDetected,
        })
    })
    .await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_nodes_talk_over_tcp() {
    let directory = Arc::new(DidDirectory::new());
    let mut nodes = Vec::new();
    for _ in 0..2 {
        let identity = AgentIdentity::generate();
        directory.register(identity.document()).unwrap();
        let mut config = ProtocolConfig::default();
        config.transport.tcp_listen = Some("127.0.0.1:0".into());
        let resolver: Arc<dyn KeyResolver> = directory.clone();
        nodes.push(ProtocolNode::builder(identity, resolver, config).start().await.unwrap());
    }
    let (a, b) = (&nodes[0], &nodes[1]);
    assert_eq!(a.local_endpoints().len(), 1);
    introduce(b, a).await;
    let mut sub = b.subscribe(IntentPattern::parse("research:*").unwrap());

    let envelope = Envelope::request(INTENT, "batch").unwrap();
    let cid = envelope.correlation_id();
    let receipt = a.submit(envelope).await.unwrap();
    assert_eq!(receipt.endpoint, b.local_endpoints()[0]);
    assert_eq!(next(&mut sub).await.correlation_id(), cid);
}

#[tokio::test]
async fn test_invalid_config_refuses_to_start() {
    let mut config = ProtocolConfig::default();
    config.node.control_class = "missing".into();
    let identity = AgentIdentity::generate();
    let resolver: Arc<dyn KeyResolver> = Arc::new(DidDirectory::new());
    let err = ProtocolNode::builder(identity, resolver, config)
        .start()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}
