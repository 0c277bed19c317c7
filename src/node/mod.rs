//! Protocol node.
//!
//! Wires the components into the upper-layer contract:
//!
//! ```text
//! submit -> resolve -> admit/enqueue -> [worker] handshake -> seal -> send
//! inbound frame -> open (verify, replay check) -> registry | handshake | deliver
//! ```
//!
//! Delivered envelopes reach the upper layer through [`Subscription`]s.

pub mod delivery;
mod inbound;

pub use delivery::{DeliveryLog, Subscription};

use crate::config::ProtocolConfig;
use crate::core::{now_millis, CorrelationId, Endpoint, Error, Result, SessionId};
use crate::envelope::{Envelope, EnvelopeFlags, MessageType};
use crate::intent::{
    CapabilityAdvertisement, CapabilityObservation, CapabilityRecord, CapabilityRegistry,
    DeliveryOutcome, IntentIdentifier, IntentPattern, IntentResolver, QosHint, VersionConstraint,
};
use crate::observability::{CounterEvent, Hooks, LifecycleStage};
use crate::qos::{Dispatch, QosScheduler, Scheduled};
use crate::security::{
    AgentIdentity, HandshakeAccept, HandshakeExchange, HandshakeOffer, KeyResolver, Sealed,
    SecurityManager,
};
use crate::transport::{
    DeliveryReceipt, InboundFrame, OutboundFrame, SecurityRequirement, SelectionContext,
    SelectionPolicy, TcpTransport, TransportBackend, TransportHandle, TransportLayer,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const HANDSHAKE_INTENT: &str = "iicp:session:handshake@1.0.0";
const CLOSE_INTENT: &str = "iicp:session:close@1.0.0";
const ADVERTISE_INTENT: &str = "iicp:registry:advertise@1.0.0";
const HEARTBEAT_INTENT: &str = "iicp:registry:heartbeat@1.0.0";

/// Node-level settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Envelopes retained for resuming subscriptions
    pub delivery_log_capacity: usize,
    /// Live envelopes buffered per subscriber before it must catch up from
    /// the log
    pub subscriber_buffer: usize,
    /// Period of registry, session and link housekeeping
    pub maintenance_interval_ms: u64,
    /// QoS class label for handshakes, advertisements and heartbeats
    pub control_class: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            delivery_log_capacity: 4_096,
            subscriber_buffer: 256,
            maintenance_interval_ms: 1_000,
            control_class: "interactive".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.delivery_log_capacity == 0 || self.subscriber_buffer == 0 {
            return Err(Error::Config("delivery log and subscriber buffer must be positive".into()));
        }
        if self.maintenance_interval_ms == 0 {
            return Err(Error::Config("maintenance interval must be positive".into()));
        }
        Ok(())
    }
}

/// Where an admitted envelope goes.
enum Target {
    /// Ranked candidates, best first
    Unicast(Vec<CapabilityRecord>),
    /// Every overlay member
    Broadcast,
}

struct Outbound {
    envelope: Envelope,
    target: Target,
    reply: oneshot::Sender<Result<DeliveryReceipt>>,
}

/// Assembles a [`ProtocolNode`].
///
/// Backends are bound by the caller with [`NodeBuilder::inbound`] as their
/// inbound channel, then registered with [`NodeBuilder::with_backend`].
pub struct NodeBuilder {
    identity: AgentIdentity,
    resolver: Arc<dyn KeyResolver>,
    config: ProtocolConfig,
    hooks: Hooks,
    backends: Vec<Arc<dyn TransportBackend>>,
    policy: Option<Arc<dyn SelectionPolicy>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: mpsc::Receiver<InboundFrame>,
}

impl NodeBuilder {
    pub fn new(identity: AgentIdentity, resolver: Arc<dyn KeyResolver>, config: ProtocolConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.transport.inbound_capacity.max(1));
        Self {
            identity,
            resolver,
            config,
            hooks: Hooks::new(),
            backends: Vec::new(),
            policy: None,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Channel backends must deliver received frames to.
    pub fn inbound(&self) -> mpsc::Sender<InboundFrame> {
        self.inbound_tx.clone()
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn TransportBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the configuration, bind the TCP backend if configured and
    /// start the dispatcher, inbound and housekeeping tasks.
    pub async fn start(mut self) -> Result<Arc<ProtocolNode>> {
        self.config.validate()?;
        if let Some(addr) = self.config.transport.tcp_listen.clone() {
            let tcp = TcpTransport::bind(&addr, self.inbound_tx.clone()).await?;
            self.backends.push(Arc::new(tcp));
        }

        let mut layer = TransportLayer::new(&self.config.transport, self.config.retry.clone());
        for backend in self.backends {
            layer = layer.with_backend(backend);
        }
        if let Some(policy) = self.policy {
            layer = layer.with_policy(policy);
        }

        let scheduler = Arc::new(QosScheduler::with_hooks(
            self.config.qos.clone(),
            self.hooks.clone(),
        )?);
        let node = Arc::new(ProtocolNode {
            security: SecurityManager::new(self.identity, self.resolver, self.config.security.clone()),
            registry: CapabilityRegistry::new(self.config.registry.clone()),
            resolver: IntentResolver::new(self.config.resolver.clone()),
            scheduler: scheduler.clone(),
            transport: Arc::new(layer),
            hooks: self.hooks,
            deliveries: Arc::new(DeliveryLog::new(
                self.config.node.delivery_log_capacity,
                self.config.node.subscriber_buffer,
            )),
            pending_handshakes: DashMap::new(),
            pending_responses: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            config: self.config,
        });

        let weak = Arc::downgrade(&node);
        let tasks = vec![
            tokio::spawn(dispatch_loop(weak.clone(), scheduler)),
            tokio::spawn(inbound_loop(weak.clone(), self.inbound_rx)),
            tokio::spawn(maintenance_loop(
                weak,
                Duration::from_millis(node.config.node.maintenance_interval_ms),
            )),
        ];
        *node.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;
        info!(did = %node.did(), endpoints = ?node.local_endpoints(), "protocol node started");
        Ok(node)
    }
}

/// A running protocol participant.
pub struct ProtocolNode {
    config: ProtocolConfig,
    security: SecurityManager,
    registry: CapabilityRegistry,
    resolver: IntentResolver,
    scheduler: Arc<QosScheduler<Outbound>>,
    transport: Arc<TransportLayer>,
    hooks: Hooks,
    deliveries: Arc<DeliveryLog>,
    pending_handshakes: DashMap<SessionId, oneshot::Sender<HandshakeAccept>>,
    pending_responses: DashMap<CorrelationId, oneshot::Sender<Envelope>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolNode {
    pub fn builder(
        identity: AgentIdentity,
        resolver: Arc<dyn KeyResolver>,
        config: ProtocolConfig,
    ) -> NodeBuilder {
        NodeBuilder::new(identity, resolver, config)
    }

    pub fn did(&self) -> &str {
        self.security.did()
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn security(&self) -> &SecurityManager {
        &self.security
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn local_endpoints(&self) -> Vec<Endpoint> {
        self.transport.local_endpoints()
    }

    /// Queued envelopes of a QoS class.
    pub fn queue_depth(&self, class: &str) -> Option<usize> {
        self.scheduler.depth(class)
    }

    /// Route, admit, sign and send an envelope. Resolves once a transport
    /// has accepted the frame.
    ///
    /// Wildcard intents and envelopes flagged broadcast go to every overlay
    /// member; everything else to the best capable agent, falling back to
    /// the next candidate when a transport is unavailable. Dropping the
    /// future before dispatch prevents sending.
    pub async fn submit(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        self.submit_with(envelope, None).await
    }

    /// Submit and wait for the correlated `Response`, `Ack`, `Nack` or
    /// `Error` envelope until the envelope's deadline.
    pub async fn request(&self, envelope: Envelope) -> Result<Envelope> {
        let correlation_id = envelope.correlation_id();
        let class = envelope.header.qos_class.clone();
        let deadline_ms = envelope.header.deadline_ms();
        let (tx, rx) = oneshot::channel();
        self.pending_responses.insert(correlation_id, tx);

        let result = async {
            self.submit(envelope).await?;
            let wait = Duration::from_millis(deadline_ms.saturating_sub(now_millis()));
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(Error::Internal("response channel dropped".into())),
                Err(_) => Err(Error::DeadlineExceeded {
                    correlation_id: Some(correlation_id),
                    class,
                    reason: "no response before deadline".to_string(),
                }),
            }
        }
        .await;
        self.pending_responses.remove(&correlation_id);
        result
    }

    /// Answer a delivered envelope. The reply keeps the correlation id and
    /// travels back to the signer, inside the existing session when there
    /// is one.
    pub async fn reply(
        &self,
        request: &Envelope,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
    ) -> Result<DeliveryReceipt> {
        let peer = request.trailer.key_id.clone();
        let endpoint = self
            .security
            .session(request.header.session_id)
            .and_then(|s| s.remote_endpoint);
        let record = match endpoint {
            Some(endpoint) => CapabilityRecord::new(&peer).with_endpoint(endpoint),
            None => self.registry.snapshot().get(&peer).cloned().ok_or_else(|| {
                Error::unavailable(format!("no route back to {}", peer))
                    .with_correlation(request.correlation_id())
            })?,
        };
        let envelope = request.reply(message_type).with_payload(payload);
        self.submit_with(envelope, Some(vec![record])).await
    }

    /// Follow delivered envelopes matching `pattern`.
    pub fn subscribe(&self, pattern: IntentPattern) -> Subscription {
        self.deliveries.subscribe(pattern)
    }

    /// Follow `pattern`, first replaying retained deliveries after
    /// `resume_after`.
    pub fn subscribe_from(
        &self,
        pattern: IntentPattern,
        resume_after: Option<CorrelationId>,
    ) -> Subscription {
        self.deliveries.subscribe_from(pattern, resume_after)
    }

    /// Announce this node's capabilities, to one endpoint or to every
    /// overlay member. The record is rewritten to this node's DID, and to
    /// its local endpoints if it lists none.
    pub async fn advertise(&self, record: &CapabilityRecord, to: Option<&Endpoint>) -> Result<DeliveryReceipt> {
        let mut advertisement = CapabilityAdvertisement::from_record(record);
        advertisement.agent_id = self.did().to_string();
        if advertisement.endpoints.is_empty() {
            advertisement.endpoints = self.local_endpoints();
        }
        let envelope = self
            .control(MessageType::Advertise, ADVERTISE_INTENT)?
            .with_payload(advertisement.to_bytes()?);
        self.send_control(envelope, to).await
    }

    /// Refresh this node's liveness at its peers.
    pub async fn heartbeat(
        &self,
        observation: CapabilityObservation,
        to: Option<&Endpoint>,
    ) -> Result<DeliveryReceipt> {
        let observation = CapabilityObservation {
            agent_id: self.did().to_string(),
            ..observation
        };
        let envelope = self
            .control(MessageType::Heartbeat, HEARTBEAT_INTENT)?
            .with_payload(observation.to_bytes()?);
        self.send_control(envelope, to).await
    }

    /// Close the session with `peer_did` on both sides.
    pub async fn close_session(&self, peer_did: &str) -> Result<()> {
        let id = self.security.session_for_peer(peer_did).ok_or_else(|| {
            Error::InvalidSessionState {
                correlation_id: None,
                session: SessionId::nil(),
                state: format!("NONE (no session with {})", peer_did),
            }
        })?;
        let endpoint = self.security.session(id).and_then(|s| s.remote_endpoint);
        let now = now_millis();
        let envelope = self.control(MessageType::Close, CLOSE_INTENT)?;
        let sealed = self.security.seal(envelope, id, now)?;
        self.security.close(id, now)?;
        if let Some(endpoint) = endpoint {
            self.transport
                .send_to(peer_did, endpoint, self.outbound(&sealed))
                .await?;
        }
        Ok(())
    }

    /// Stop background tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }

    async fn submit_with(
        &self,
        envelope: Envelope,
        targets: Option<Vec<CapabilityRecord>>,
    ) -> Result<DeliveryReceipt> {
        let correlation_id = envelope.correlation_id();
        let class = envelope.header.qos_class.clone();
        self.hooks.lifecycle(correlation_id, LifecycleStage::Submitted, &class);

        let result = self.admit_and_wait(envelope, targets).await;
        match &result {
            Ok(_) => self.hooks.lifecycle(correlation_id, LifecycleStage::Acknowledged, &class),
            Err(e) => {
                debug!(correlation_id = %correlation_id, class = %class, error = %e, "submit failed");
                self.hooks.failed(correlation_id, &class, e.kind());
            }
        }
        result.map_err(|e| e.with_correlation(correlation_id))
    }

    async fn admit_and_wait(
        &self,
        mut envelope: Envelope,
        targets: Option<Vec<CapabilityRecord>>,
    ) -> Result<DeliveryReceipt> {
        let target = match targets {
            Some(records) => Target::Unicast(records),
            None if envelope.header.intent.is_wildcard() || envelope.header.is_broadcast() => {
                envelope.header.flags.insert(EnvelopeFlags::BROADCAST);
                Target::Broadcast
            }
            None => Target::Unicast(self.resolve(&envelope)?),
        };

        let header = envelope.header.clone();
        let (tx, rx) = oneshot::channel();
        self.scheduler
            .enqueue(
                &header,
                Outbound {
                    envelope,
                    target,
                    reply: tx,
                },
            )
            .await?;
        self.hooks
            .lifecycle(header.correlation_id, LifecycleStage::Admitted, &header.qos_class);

        rx.await
            .map_err(|_| Error::Internal("dispatcher dropped the envelope".into()))?
    }

    fn resolve(&self, envelope: &Envelope) -> Result<Vec<CapabilityRecord>> {
        let intent = &envelope.header.intent;
        let pattern = intent.pattern();
        let constraint = VersionConstraint::compatible_with(&intent.version);
        let hint = QosHint::for_class(&envelope.header.qos_class);
        let snapshot = self.registry.snapshot();
        match self.resolver.resolve(&pattern, &constraint, &hint, &snapshot) {
            Ok(route) => {
                self.hooks.counter(CounterEvent::ResolutionHit {
                    intent: pattern.to_string(),
                });
                Ok(route.candidates.into_iter().map(|c| c.record).collect())
            }
            Err(e) => {
                self.hooks.counter(CounterEvent::ResolutionMiss {
                    intent: pattern.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Worker side of one scheduled envelope.
    async fn dispatch(self: Arc<Self>, dispatch: Dispatch<Outbound>) {
        let Dispatch { item, permit, .. } = dispatch;
        let Outbound {
            envelope,
            target,
            reply,
        } = item;
        if reply.is_closed() {
            debug!(correlation_id = %envelope.correlation_id(), "submitter gone before dispatch, not sending");
            return;
        }
        let result = match target {
            Target::Broadcast => self.deliver_broadcast(envelope).await,
            Target::Unicast(candidates) => self.deliver_unicast(envelope, candidates).await,
        };
        drop(permit);
        let _ = reply.send(result);
    }

    async fn deliver_broadcast(&self, envelope: Envelope) -> Result<DeliveryReceipt> {
        let sealed = self.security.seal_session_less(envelope)?;
        let header = &sealed.envelope.header;
        self.hooks
            .lifecycle(header.correlation_id, LifecycleStage::Signed, &header.qos_class);
        let ticket = self.transport.broadcast(self.outbound(&sealed));
        self.hooks
            .lifecycle(header.correlation_id, LifecycleStage::Dispatched, &header.qos_class);
        let receipt = ticket.await?;
        self.hooks.counter(CounterEvent::Sent {
            class: header.qos_class.clone(),
        });
        Ok(receipt)
    }

    async fn deliver_unicast(
        &self,
        envelope: Envelope,
        candidates: Vec<CapabilityRecord>,
    ) -> Result<DeliveryReceipt> {
        let mut last_error = None;
        for candidate in &candidates {
            match self.deliver_to(&envelope, candidate).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) if e.is_retryable() => {
                    warn!(
                        correlation_id = %envelope.correlation_id(),
                        agent = %candidate.agent_id,
                        error = %e,
                        "candidate unreachable, trying next"
                    );
                    self.registry
                        .record_outcome(&candidate.agent_id, DeliveryOutcome::Failed);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::unavailable("no candidate to deliver to")))
    }

    async fn deliver_to(&self, envelope: &Envelope, candidate: &CapabilityRecord) -> Result<DeliveryReceipt> {
        let header = &envelope.header;
        let ctx = SelectionContext::new(candidate, &header.qos_class)
            .with_security(SecurityRequirement::from_flags(header.flags))
            .with_hint(self.security.transport_hint_for(&candidate.agent_id));
        let handles = self.transport.select(&ctx)?;
        let reply_endpoint = handles
            .first()
            .and_then(|h| self.transport.local_endpoint(h.kind()));

        let exchange = TransportExchange {
            node: self,
            handles: handles.clone(),
            class: header.qos_class.clone(),
        };
        let session = self
            .security
            .handshake(&candidate.agent_id, reply_endpoint, &exchange)
            .await?;

        let sealed = self.security.seal(envelope.clone(), session, now_millis())?;
        self.hooks
            .lifecycle(header.correlation_id, LifecycleStage::Signed, &header.qos_class);
        let started = Instant::now();
        let ticket = self.transport.send(handles, self.outbound(&sealed));
        self.hooks
            .lifecycle(header.correlation_id, LifecycleStage::Dispatched, &header.qos_class);
        let receipt = ticket.await?;
        self.registry.record_outcome(
            &candidate.agent_id,
            DeliveryOutcome::Delivered {
                round_trip_ms: started.elapsed().as_secs_f64() * 1_000.0,
            },
        );
        self.hooks.counter(CounterEvent::Sent {
            class: header.qos_class.clone(),
        });
        Ok(receipt)
    }

    async fn send_control(&self, envelope: Envelope, to: Option<&Endpoint>) -> Result<DeliveryReceipt> {
        let envelope = match to {
            Some(_) => envelope,
            None => envelope.with_flag(EnvelopeFlags::BROADCAST),
        };
        let sealed = self.security.seal_session_less(envelope)?;
        let frame = self.outbound(&sealed);
        match to {
            Some(endpoint) => {
                self.transport
                    .send_to(&endpoint.address, endpoint.clone(), frame)
                    .await
            }
            None => self.transport.broadcast(frame).await,
        }
    }

    fn control(&self, message_type: MessageType, intent: &str) -> Result<Envelope> {
        Ok(Envelope::new(
            message_type,
            IntentIdentifier::parse(intent)?,
            &self.config.node.control_class,
        )
        .with_ttl(self.control_ttl()))
    }

    fn control_ttl(&self) -> u32 {
        u32::try_from(self.config.security.handshake_timeout_ms).unwrap_or(u32::MAX)
    }

    fn outbound(&self, sealed: &Sealed) -> OutboundFrame {
        let header = &sealed.envelope.header;
        OutboundFrame {
            frame: Bytes::from(sealed.frame.clone()),
            correlation_id: header.correlation_id,
            class: header.qos_class.clone(),
            deadline_ms: header.deadline_ms(),
        }
    }

    fn housekeeping(&self, now_ms: u64) {
        let evicted = self.registry.evict_expired(now_ms);
        let retired = self.security.expire_idle(now_ms);
        let closed = self.transport.evict_idle(now_ms);
        self.pending_handshakes.retain(|_, tx| !tx.is_closed());
        self.pending_responses.retain(|_, tx| !tx.is_closed());
        if !evicted.is_empty() || !retired.is_empty() || closed > 0 {
            debug!(
                records = evicted.len(),
                sessions = retired.len(),
                links = closed,
                "housekeeping"
            );
        }
    }
}

impl Drop for ProtocolNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProtocolNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolNode")
            .field("did", &self.did())
            .field("transport", &self.transport)
            .field("sessions", &self.security.session_count())
            .finish_non_exhaustive()
    }
}

/// Carries a handshake offer over the transport and waits for the
/// `HandshakeAck` the inbound pipeline hands back.
struct TransportExchange<'a> {
    node: &'a ProtocolNode,
    handles: Vec<TransportHandle>,
    class: String,
}

#[async_trait]
impl HandshakeExchange for TransportExchange<'_> {
    async fn exchange(&self, offer: HandshakeOffer) -> Result<HandshakeAccept> {
        let node = self.node;
        let session_id = offer.session_id;
        let (tx, rx) = oneshot::channel();
        node.pending_handshakes.insert(session_id, tx);

        let result = async {
            let envelope = Envelope::new(
                MessageType::Handshake,
                IntentIdentifier::parse(HANDSHAKE_INTENT)?,
                &self.class,
            )
            .with_ttl(node.control_ttl())
            .with_payload(offer.to_bytes()?);
            let sealed = node.security.seal_session_less(envelope)?;
            node.transport
                .send(self.handles.clone(), node.outbound(&sealed))
                .await?;
            rx.await
                .map_err(|_| Error::auth("handshake abandoned before an answer arrived"))
        }
        .await;
        node.pending_handshakes.remove(&session_id);
        result
    }
}

async fn dispatch_loop(node: Weak<ProtocolNode>, scheduler: Arc<QosScheduler<Outbound>>) {
    loop {
        let scheduled = scheduler.next().await;
        let Some(node) = node.upgrade() else {
            break;
        };
        match scheduled {
            Scheduled::Ready(dispatch) => {
                tokio::spawn(node.dispatch(dispatch));
            }
            Scheduled::Expired(expired) => {
                let error = expired.error();
                let _ = expired.item.reply.send(Err(error));
            }
        }
    }
}

async fn inbound_loop(node: Weak<ProtocolNode>, mut inbound: mpsc::Receiver<InboundFrame>) {
    while let Some(frame) = inbound.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        node.handle_inbound(frame);
    }
}

async fn maintenance_loop(node: Weak<ProtocolNode>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(node) = node.upgrade() else {
            break;
        };
        node.housekeeping(now_millis());
    }
}

#[cfg(test)]
mod tests;
