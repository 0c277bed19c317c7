//! Inbound pipeline: every frame is opened by the security manager before
//! any of its content is acted on.

use super::ProtocolNode;
use crate::core::{now_millis, Error, Result};
use crate::envelope::{Envelope, MessageType};
use crate::intent::{CapabilityAdvertisement, CapabilityObservation};
use crate::observability::CounterEvent;
use crate::security::{HandshakeAccept, HandshakeOffer};
use crate::transport::InboundFrame;
use std::sync::Arc;
use tracing::{debug, warn};

impl ProtocolNode {
    pub(super) fn handle_inbound(self: &Arc<Self>, inbound: InboundFrame) {
        let envelope = match self.security.open(&inbound.frame, now_millis()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(transport = %inbound.kind, from = ?inbound.from, error = %e, "inbound envelope rejected");
                self.hooks.counter(CounterEvent::InboundRejected { kind: e.kind() });
                return;
            }
        };
        let correlation_id = envelope.correlation_id();
        let message_type = envelope.message_type();
        if let Err(e) = self.route_inbound(envelope) {
            warn!(correlation_id = %correlation_id, message_type = %message_type, error = %e, "inbound envelope dropped");
            self.hooks.counter(CounterEvent::InboundRejected { kind: e.kind() });
        }
    }

    fn route_inbound(self: &Arc<Self>, envelope: Envelope) -> Result<()> {
        match envelope.message_type() {
            MessageType::Handshake => self.on_handshake(&envelope),
            MessageType::HandshakeAck => self.on_handshake_ack(&envelope),
            MessageType::Advertise => self.on_advertise(&envelope),
            MessageType::Observe | MessageType::Heartbeat => self.on_observation(&envelope),
            MessageType::Close => {
                debug!(session = %envelope.header.session_id, peer = %envelope.trailer.key_id, "session closed by peer");
                Ok(())
            }
            MessageType::Response | MessageType::Ack | MessageType::Nack | MessageType::Error => {
                let waiter = self
                    .pending_responses
                    .remove(&envelope.correlation_id())
                    .map(|(_, tx)| tx);
                match waiter {
                    Some(tx) => {
                        if let Err(envelope) = tx.send(envelope) {
                            self.deliveries.push(Arc::new(envelope));
                        }
                    }
                    None => self.deliveries.push(Arc::new(envelope)),
                }
                Ok(())
            }
            _ => {
                self.deliveries.push(Arc::new(envelope));
                Ok(())
            }
        }
    }

    /// Responder side: accept the offer and answer to the initiator's reply
    /// endpoint over the transport the offer came through.
    fn on_handshake(self: &Arc<Self>, envelope: &Envelope) -> Result<()> {
        let offer = HandshakeOffer::from_bytes(&envelope.plain_payload()?)?;
        if offer.initiator_did != envelope.trailer.key_id {
            return Err(Error::auth(format!(
                "offer for {} signed by {}",
                offer.initiator_did, envelope.trailer.key_id
            )));
        }
        let reply_to = offer
            .reply_endpoint
            .clone()
            .ok_or_else(|| Error::auth("handshake offer without reply endpoint"))?;
        let local = self.transport.local_endpoint(reply_to.kind);
        let accept = self.security.accept(&offer, local, now_millis())?;

        let answer = envelope
            .reply(MessageType::HandshakeAck)
            .with_payload(accept.to_bytes()?);
        let sealed = self.security.seal_session_less(answer)?;
        let ticket = self
            .transport
            .send_to(&offer.initiator_did, reply_to, self.outbound(&sealed));
        let peer = offer.initiator_did;
        tokio::spawn(async move {
            if let Err(e) = ticket.await {
                warn!(peer = %peer, error = %e, "handshake answer not delivered");
            }
        });
        Ok(())
    }

    fn on_handshake_ack(&self, envelope: &Envelope) -> Result<()> {
        let accept = HandshakeAccept::from_bytes(&envelope.plain_payload()?)?;
        if accept.responder_did != envelope.trailer.key_id {
            return Err(Error::auth(format!(
                "answer for {} signed by {}",
                accept.responder_did, envelope.trailer.key_id
            )));
        }
        match self.pending_handshakes.remove(&accept.session_id) {
            Some((_, tx)) => {
                let _ = tx.send(accept);
                Ok(())
            }
            None => Err(Error::auth(format!(
                "no pending handshake for {}",
                accept.session_id
            ))),
        }
    }

    fn on_advertise(&self, envelope: &Envelope) -> Result<()> {
        let advertisement = CapabilityAdvertisement::from_bytes(&envelope.plain_payload()?)?;
        if advertisement.agent_id != envelope.trailer.key_id {
            return Err(Error::auth(format!(
                "advertisement for {} signed by {}",
                advertisement.agent_id, envelope.trailer.key_id
            )));
        }
        if advertisement.agent_id == self.did() {
            return Ok(());
        }
        let agent = advertisement.agent_id.clone();
        if self.registry.apply_advertisement(advertisement, now_millis()) {
            debug!(agent = %agent, "capability record updated");
        }
        Ok(())
    }

    fn on_observation(&self, envelope: &Envelope) -> Result<()> {
        let observation = CapabilityObservation::from_bytes(&envelope.plain_payload()?)?;
        if observation.agent_id != envelope.trailer.key_id {
            return Err(Error::auth(format!(
                "observation for {} signed by {}",
                observation.agent_id, envelope.trailer.key_id
            )));
        }
        if !self.registry.heartbeat(&observation, now_millis()) {
            debug!(agent = %observation.agent_id, "observation for unknown agent ignored");
        }
        Ok(())
    }
}
