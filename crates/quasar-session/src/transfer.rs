//! Transfer handler: the head of every established session's chain and the only
//! handler that touches the raw transport.
//!
//! Outbound data is sequenced and buffered, then flushed as a single frame or
//! a batch when the buffer reaches `flush_threshold`, on an explicit flush, or
//! on the next tick. Heartbeats skip the buffer. Inbound data is delivered
//! strictly in sequence: duplicates are dropped and a gap closes the session.
//!
//! In verified mode sent messages are kept until the peer acknowledges them,
//! so the session survives the loss of its transport: the loop attaches a
//! replacement through [`ReadEvent::Resume`] and unacknowledged messages are
//! replayed in order. Acknowledgements ride on outbound data and heartbeats;
//! a receiver with nothing to say sends a bare [`Frame::Ack`] on the next tick,
//! or at once when half of the peer's retention window is unacknowledged.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::codec::{Codec, CodecError};
use crate::handshake::{HandshakeMode, check_echo};
use crate::pipeline::{Effect, Handler, HandlerContext, ReadEvent};
use crate::protocol::{
    ConnectRequest, ConnectResponse, Frame, Heartbeat, Payload, SocketMessage, WireMessage,
    encode_message,
};
use crate::session::{SessionConfig, SessionKey};
use crate::support::AppEvent;
use crate::transport::{SocketEvent, SocketEventKind, SocketTransport, TransportId};

/// Name of the transfer handler in a session's chain.
pub const TRANSFER_HANDLER: &str = "transfer";

/// In-process link to the twin session of a co-located pair.
#[derive(Debug, Clone)]
pub struct LocalLink {
    pub(crate) id: TransportId,
    pub(crate) twin: SessionKey,
}

/// What carries a session's traffic.
#[derive(Debug, Clone)]
pub enum Link {
    /// A TCP transport.
    Socket(SocketTransport),
    /// Direct delivery to the twin session in the same loop.
    Local(LocalLink),
}

impl Link {
    fn id(&self) -> TransportId {
        match self {
            Link::Socket(transport) => transport.id(),
            Link::Local(local) => local.id,
        }
    }
}

/// Replacement transport handed to a detached verified session.
#[derive(Debug)]
pub struct ResumeLink {
    pub(crate) transport: SocketTransport,
    pub(crate) role: ResumeRole,
}

#[derive(Debug)]
pub(crate) enum ResumeRole {
    /// Initiator side: send this request once sequencing fields are filled in.
    Initiate(ConnectRequest),
    /// Acceptor side: the request was admitted, answer with this response.
    Accept(ConnectResponse),
}

/// Owns the transport of an established session.
pub struct TransferHandler<P> {
    link: Option<Link>,
    mode: HandshakeMode,
    flush_threshold: usize,
    max_unacked: usize,
    outbound: Vec<SocketMessage<P>>,
    unacked: VecDeque<SocketMessage<P>>,
    next_sequence: u64,
    delivered: u64,
    /// Last acknowledgement put on the wire.
    acked: u64,
    resume_timeout: Duration,
    resuming: Option<PendingResume>,
}

/// A resume request waiting for the acceptor's answer.
struct PendingResume {
    request: ConnectRequest,
    deadline: Instant,
}

impl<P: Send + 'static> TransferHandler<P> {
    /// Create a handler for `link` using the buffering settings in `config`.
    pub fn new(link: Link, config: &SessionConfig) -> Self {
        Self {
            link: Some(link),
            mode: config.mode,
            flush_threshold: config.flush_threshold.max(1),
            max_unacked: config.max_unacked,
            outbound: Vec::new(),
            unacked: VecDeque::new(),
            next_sequence: 1,
            delivered: 0,
            acked: 0,
            resume_timeout: config.verify_timeout,
            resuming: None,
        }
    }

    /// Oldest sequence this side can still (re)send.
    fn oldest_retained(&self) -> u64 {
        self.unacked
            .front()
            .or(self.outbound.first())
            .map_or(self.next_sequence, |m| m.sequence)
    }

    /// Whether a peer that delivered up to `peer_ack` can continue from what we retain.
    fn can_continue_from(&self, peer_ack: u64) -> bool {
        peer_ack.saturating_add(1) >= self.oldest_retained()
    }

    fn prune(&mut self, ack: u64) {
        while self.unacked.front().is_some_and(|m| m.sequence <= ack) {
            self.unacked.pop_front();
        }
    }

    fn writable(&self) -> Option<&Link> {
        if self.resuming.is_some() {
            return None;
        }
        self.link.as_ref()
    }

    fn send_heartbeat(&mut self, ctx: &mut HandlerContext<'_, P>, beat: Heartbeat) {
        let ack = self.delivered;
        match self.writable() {
            Some(Link::Socket(transport)) => {
                transport.send(Frame::Heartbeat { beat, ack });
            }
            Some(Link::Local(local)) => {
                let event = SocketEvent {
                    transport: local.id,
                    kind: SocketEventKind::Heartbeat { beat, ack },
                };
                let to = local.twin.clone();
                ctx.push_effect(Effect::DeliverLocal { to, event });
            }
            None => {
                tracing::trace!("Heartbeat on detached {} dropped", ctx.key());
                return;
            }
        }
        self.acked = ack;
    }

    /// Whether the peer is owed an acknowledgement it has not seen yet.
    fn ack_pending(&self) -> bool {
        self.mode == HandshakeMode::Verified && self.delivered > self.acked
    }

    /// Send a bare acknowledgement of everything delivered so far.
    fn send_ack(&mut self, ctx: &mut HandlerContext<'_, P>) {
        let Some(Link::Socket(transport)) = self.writable() else {
            return;
        };
        tracing::trace!("Acknowledging {} on {}", self.delivered, ctx.key());
        transport.send(Frame::Ack { ack: self.delivered });
        self.acked = self.delivered;
    }

    fn flush(&mut self, ctx: &mut HandlerContext<'_, P>) {
        if self.outbound.is_empty() {
            return;
        }
        if self.mode == HandshakeMode::Verified
            && self.outbound.len() + self.unacked.len() > self.max_unacked
        {
            tracing::warn!(
                "Session {} exceeded {} unacknowledged messages, closing",
                ctx.key(),
                self.max_unacked
            );
            ctx.close_session();
            return;
        }

        let ack = self.delivered;
        match self.writable() {
            None => {}
            Some(Link::Local(local)) => {
                let (id, to) = (local.id, local.twin.clone());
                for message in std::mem::take(&mut self.outbound) {
                    let copy = SocketMessage {
                        sequence: message.sequence,
                        ack,
                        payload: local_copy(ctx.codec(), &message.payload),
                    };
                    ctx.push_effect(Effect::DeliverLocal {
                        to: to.clone(),
                        event: SocketEvent {
                            transport: id,
                            kind: SocketEventKind::Data(copy),
                        },
                    });
                }
                self.acked = ack;
            }
            Some(Link::Socket(transport)) => {
                let transport = transport.clone();
                let batch = std::mem::take(&mut self.outbound);
                match encode_frame(ctx.codec(), &batch, ack) {
                    Ok(frame) => {
                        tracing::trace!("Flushing {} message(s) on {}", batch.len(), ctx.key());
                        transport.send(frame);
                        self.acked = ack;
                    }
                    Err(e) => {
                        tracing::error!("Failed to encode outbound message on {}: {e}", ctx.key());
                        ctx.close_session();
                        return;
                    }
                }
                if self.mode == HandshakeMode::Verified {
                    self.unacked.extend(batch);
                }
            }
        }
    }

    fn replay(&mut self, ctx: &mut HandlerContext<'_, P>) {
        let Some(Link::Socket(transport)) = self.link.as_ref() else {
            return;
        };
        if self.unacked.is_empty() {
            return;
        }
        match encode_frame(ctx.codec(), self.unacked.make_contiguous(), self.delivered) {
            Ok(frame) => {
                tracing::debug!("Replaying {} message(s) on {}", self.unacked.len(), ctx.key());
                transport.send(frame);
                self.acked = self.delivered;
            }
            Err(e) => {
                tracing::error!("Failed to encode replay on {}: {e}", ctx.key());
                ctx.close_session();
            }
        }
    }

    fn on_socket(&mut self, ctx: &mut HandlerContext<'_, P>, event: SocketEvent<P>) {
        let SocketEvent { transport, kind } = event;
        if self.link.as_ref().map(Link::id) != Some(transport) {
            if !matches!(kind, SocketEventKind::TransportClosed) {
                tracing::debug!("Closing stale transport {transport:?} of {}", ctx.key());
                ctx.push_effect(Effect::CloseTransport(transport));
            }
            return;
        }

        match kind {
            SocketEventKind::Data(message) => self.on_data(ctx, message),
            SocketEventKind::Heartbeat { beat, ack } => {
                self.prune(ack);
                ctx.fire_read(ReadEvent::Payload(Payload::Heartbeat(beat)));
            }
            SocketEventKind::Ack(ack) => self.prune(ack),
            SocketEventKind::ConnectResponse(response) => self.on_resume_response(ctx, response),
            SocketEventKind::TransportClosed => self.on_transport_closed(ctx),
            SocketEventKind::ConnectRequest(_) => {
                tracing::warn!("Connect request on established {}, closing", ctx.key());
                ctx.close_session();
            }
        }
    }

    fn on_data(&mut self, ctx: &mut HandlerContext<'_, P>, message: SocketMessage<P>) {
        self.prune(message.ack);
        if message.sequence <= self.delivered {
            tracing::trace!("Dropped duplicate message {} on {}", message.sequence, ctx.key());
            return;
        }
        if message.sequence != self.delivered + 1 {
            tracing::warn!(
                "Sequence gap on {}: expected {}, got {}, closing",
                ctx.key(),
                self.delivered + 1,
                message.sequence
            );
            ctx.close_session();
            return;
        }
        self.delivered = message.sequence;
        ctx.fire_read(ReadEvent::Payload(message.payload));
        if self.ack_pending() && self.delivered - self.acked >= (self.max_unacked as u64 / 2).max(1) {
            self.send_ack(ctx);
        }
    }

    fn on_transport_closed(&mut self, ctx: &mut HandlerContext<'_, P>) {
        let resumable = self.mode == HandshakeMode::Verified && matches!(self.link, Some(Link::Socket(_)));
        if resumable {
            tracing::info!("Transport of {} lost, waiting for resume", ctx.key());
            self.link = None;
            self.resuming = None;
            ctx.push_effect(Effect::TransportLost {
                key: ctx.key().clone(),
            });
        } else {
            tracing::info!("Transport of {} closed", ctx.key());
            ctx.close_session();
        }
    }

    fn on_resume(&mut self, ctx: &mut HandlerContext<'_, P>, link: ResumeLink) {
        let ResumeLink { transport, role } = link;
        if let Some(Link::Socket(old)) = self.link.replace(Link::Socket(transport.clone())) {
            if old.id() != transport.id() {
                old.close();
            }
        }

        match role {
            ResumeRole::Initiate(mut request) => {
                request.sequence_base = self.oldest_retained();
                request.ack_base = self.delivered;
                tracing::debug!(
                    "Resuming {} on {:?} from sequence {}",
                    ctx.key(),
                    transport.id(),
                    request.sequence_base
                );
                transport.send(Frame::ConnectRequest(request.clone()));
                self.acked = self.delivered;
                self.resuming = Some(PendingResume {
                    request,
                    deadline: Instant::now() + self.resume_timeout,
                });
            }
            ResumeRole::Accept(mut response) => {
                let request = &response.echoed_request;
                let peer_ack = request.ack_base;
                if request.sequence_base > self.delivered + 1 || !self.can_continue_from(peer_ack) {
                    tracing::warn!("Resume of {} would lose messages, closing", ctx.key());
                    ctx.close_session();
                    return;
                }
                response.ack_base = self.delivered;
                transport.send(Frame::ConnectResponse(response));
                self.acked = self.delivered;
                self.resuming = None;
                self.resumed(ctx, peer_ack);
            }
        }
    }

    fn on_resume_response(&mut self, ctx: &mut HandlerContext<'_, P>, response: ConnectResponse) {
        let Some(PendingResume { request, .. }) = self.resuming.take() else {
            tracing::warn!("Unexpected connect response on {}, closing", ctx.key());
            ctx.close_session();
            return;
        };
        if let Err(e) = check_echo(&request, &response) {
            tracing::warn!("Resume of {} failed: {e}", ctx.key());
            ctx.close_session();
            return;
        }
        if !response.accepted || !self.can_continue_from(response.ack_base) {
            tracing::info!("Resume of {} refused, closing", ctx.key());
            ctx.close_session();
            return;
        }
        ctx.push_effect(Effect::ResumeConfirmed {
            key: ctx.key().clone(),
            attempt: request.verifying_attempt,
        });
        self.resumed(ctx, response.ack_base);
    }

    /// The acceptor never answered: drop the replacement and ask for another.
    fn resume_timed_out(&mut self, ctx: &mut HandlerContext<'_, P>) {
        tracing::warn!("Resume of {} unanswered, dropping transport", ctx.key());
        self.resuming = None;
        if let Some(Link::Socket(transport)) = self.link.take() {
            transport.close();
        }
        ctx.push_effect(Effect::TransportLost {
            key: ctx.key().clone(),
        });
    }

    fn resumed(&mut self, ctx: &mut HandlerContext<'_, P>, peer_ack: u64) {
        self.prune(peer_ack);
        self.replay(ctx);
        self.flush(ctx);
        tracing::info!("Session {} resumed", ctx.key());
    }
}

impl<P: Send + 'static> Handler<P> for TransferHandler<P> {
    fn name(&self) -> &'static str {
        TRANSFER_HANDLER
    }

    fn on_active(&mut self, ctx: &mut HandlerContext<'_, P>) {
        if let Some(handle) = ctx.session_handle() {
            ctx.notify(AppEvent::Connected(handle));
        }
        ctx.fire_active();
    }

    fn on_inactive(&mut self, ctx: &mut HandlerContext<'_, P>) {
        ctx.notify(AppEvent::Disconnected {
            key: ctx.key().clone(),
            remote: ctx.remote().cloned(),
        });
        ctx.fire_inactive();
    }

    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        match event {
            ReadEvent::Socket(event) => self.on_socket(ctx, event),
            ReadEvent::Resume(link) => self.on_resume(ctx, link),
            other => ctx.fire_read(other),
        }
    }

    fn on_write(&mut self, ctx: &mut HandlerContext<'_, P>, payload: Payload<P>) {
        if let Payload::Heartbeat(beat) = payload {
            self.send_heartbeat(ctx, beat);
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.outbound.push(SocketMessage {
            sequence,
            ack: 0,
            payload,
        });
        if self.outbound.len() >= self.flush_threshold {
            self.flush(ctx);
        }
    }

    fn on_flush(&mut self, ctx: &mut HandlerContext<'_, P>) {
        self.flush(ctx);
    }

    fn on_close(&mut self, ctx: &mut HandlerContext<'_, P>) {
        self.flush(ctx);
        match self.link.take() {
            Some(Link::Socket(transport)) => transport.close(),
            Some(Link::Local(local)) => ctx.push_effect(Effect::CloseSession(local.twin)),
            None => {}
        }
    }

    fn on_tick(&mut self, ctx: &mut HandlerContext<'_, P>, now: Instant) {
        if self.resuming.as_ref().is_some_and(|pending| now >= pending.deadline) {
            self.resume_timed_out(ctx);
        }
        self.flush(ctx);
        if self.ack_pending() {
            self.send_ack(ctx);
        }
        ctx.fire_tick(now);
    }
}

fn encode_frame<P: 'static>(
    codec: &dyn Codec<P>,
    messages: &[SocketMessage<P>],
    ack: u64,
) -> Result<Frame, CodecError> {
    let wires = messages
        .iter()
        .map(|message| {
            encode_message(message, codec).map(|wire| WireMessage { ack, ..wire })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(match <[WireMessage; 1]>::try_from(wires) {
        Ok([single]) => Frame::Data(single),
        Err(wires) => Frame::Batch(wires),
    })
}

fn local_copy<P: 'static>(codec: &dyn Codec<P>, payload: &Payload<P>) -> Payload<P> {
    match payload {
        Payload::OneWay(body) => Payload::OneWay(codec.clone_for_local_delivery(body)),
        Payload::Request { request_id, body } => Payload::Request {
            request_id: *request_id,
            body: codec.clone_for_local_delivery(body),
        },
        Payload::Response { request_id, body } => Payload::Response {
            request_id: *request_id,
            body: codec.clone_for_local_delivery(body),
        },
        Payload::Heartbeat(beat) => Payload::Heartbeat(*beat),
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::pipeline::testing::Harness;
    use crate::protocol::{Endpoint, SessionId, WireKind};
    use crate::support::OneWaySupport;
    use crate::transport::WriterCommand;

    const T: TransportId = TransportId(1);

    fn harness(config: SessionConfig) -> (Harness, UnboundedReceiver<WriterCommand>) {
        let (transport, frames) = SocketTransport::detached(T);
        let mut harness = Harness::new(config.clone());
        harness.add(TransferHandler::<String>::new(Link::Socket(transport), &config));
        harness.add(OneWaySupport);
        (harness, frames)
    }

    fn verified(flush_threshold: usize) -> SessionConfig {
        SessionConfig {
            mode: HandshakeMode::Verified,
            flush_threshold,
            ..SessionConfig::default()
        }
    }

    fn sent(frames: &mut UnboundedReceiver<WriterCommand>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(command) = frames.try_recv() {
            if let WriterCommand::Send(frame) = command {
                out.push(frame);
            }
        }
        out
    }

    fn sequences(frame: &Frame) -> Vec<u64> {
        match frame {
            Frame::Data(wire) => vec![wire.sequence],
            Frame::Batch(wires) => wires.iter().map(|w| w.sequence).collect(),
            _ => Vec::new(),
        }
    }

    fn one_way(text: &str) -> Payload<String> {
        Payload::OneWay(text.to_string())
    }

    fn data(sequence: u64, ack: u64, text: &str) -> SocketEventKind<String> {
        SocketEventKind::Data(SocketMessage {
            sequence,
            ack,
            payload: one_way(text),
        })
    }

    fn messages(harness: &Harness) -> Vec<String> {
        harness
            .app_events()
            .into_iter()
            .filter_map(|event| match event {
                AppEvent::Message { payload, .. } => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_buffer_flushes_at_threshold_as_one_batch() {
        let (mut harness, mut frames) = harness(SessionConfig {
            flush_threshold: 3,
            ..SessionConfig::default()
        });
        harness.write(one_way("a"));
        harness.write(one_way("b"));
        assert!(sent(&mut frames).is_empty());

        harness.write(one_way("c"));
        let frames = sent(&mut frames);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Batch(_)));
        assert_eq!(sequences(&frames[0]), vec![1, 2, 3]);
    }

    #[test]
    fn test_single_message_flush_is_a_data_frame() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.write(one_way("only"));
        harness.flush();
        let frames = sent(&mut frames);
        assert!(matches!(&frames[..], [Frame::Data(wire)] if wire.kind == WireKind::OneWay && wire.sequence == 1));
    }

    #[test]
    fn test_tick_flushes_pending_messages() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.tick(Instant::now());
        assert!(sent(&mut frames).is_empty());

        harness.write(one_way("x"));
        harness.write(one_way("y"));
        harness.tick(Instant::now());
        assert_eq!(sequences(&sent(&mut frames)[0]), vec![1, 2]);
    }

    #[test]
    fn test_heartbeat_bypasses_buffer() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.write(one_way("queued"));
        harness.write(Payload::Heartbeat(Heartbeat::Ping));
        assert!(matches!(
            &sent(&mut frames)[..],
            [Frame::Heartbeat { beat: Heartbeat::Ping, ack: 0 }]
        ));
    }

    #[test]
    fn test_inbound_in_order_duplicates_dropped() {
        let (mut harness, _frames) = harness(SessionConfig::default());
        harness.socket(T, data(1, 0, "one"));
        harness.socket(T, data(1, 0, "one again"));
        harness.socket(T, data(2, 0, "two"));
        assert_eq!(messages(&harness), vec!["one", "two"]);
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_sequence_gap_closes_session() {
        let (mut harness, _frames) = harness(SessionConfig::default());
        harness.socket(T, data(2, 0, "skipped one"));
        assert!(messages(&harness).is_empty());
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseSession(_)]));
    }

    #[test]
    fn test_ack_is_piggybacked_on_writes() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.socket(T, data(1, 0, "in"));
        harness.write(one_way("out"));
        harness.flush();
        assert!(matches!(&sent(&mut frames)[..], [Frame::Data(wire)] if wire.ack == 1));
    }

    #[test]
    fn test_stale_transport_is_closed_quietly() {
        let (mut harness, _frames) = harness(SessionConfig::default());
        harness.socket(TransportId(42), data(1, 0, "ghost"));
        harness.socket(TransportId(42), SocketEventKind::TransportClosed);
        assert!(messages(&harness).is_empty());
        assert!(matches!(
            harness.take_effects().as_slice(),
            [Effect::CloseTransport(TransportId(42))]
        ));
    }

    #[test]
    fn test_transport_loss_closes_trusted_session() {
        let (mut harness, _frames) = harness(SessionConfig::default());
        harness.socket(T, SocketEventKind::TransportClosed);
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseSession(_)]));
    }

    #[test]
    fn test_close_flushes_then_closes_socket() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.write(one_way("last words"));
        harness.close();
        let mut commands = Vec::new();
        while let Ok(command) = frames.try_recv() {
            commands.push(command);
        }
        assert!(matches!(
            commands.as_slice(),
            [WriterCommand::Send(Frame::Data(_)), WriterCommand::Close]
        ));
    }

    #[test]
    fn test_verified_loss_detaches_and_acceptor_resume_replays() {
        let (mut harness, mut frames) = harness(verified(1));
        harness.write(one_way("m1"));
        harness.write(one_way("m2"));
        harness.socket(T, data(1, 1, "peer saw m1"));
        let _ = sent(&mut frames);

        harness.socket(T, SocketEventKind::TransportClosed);
        assert!(matches!(harness.take_effects().as_slice(), [Effect::TransportLost { .. }]));

        harness.write(one_way("m3"));
        assert!(sent(&mut frames).is_empty());

        let (replacement, mut new_frames) = SocketTransport::detached(TransportId(2));
        let request = ConnectRequest {
            sequence_base: 2,
            ack_base: 1,
            ..ConnectRequest::verified(Endpoint::new("B", "battle"), Endpoint::new("A", "gate"), 0, 2, 1)
        };
        harness.read(ReadEvent::Resume(ResumeLink {
            transport: replacement,
            role: ResumeRole::Accept(ConnectResponse::accept(request, Endpoint::new("A", "gate"))),
        }));

        let frames = sent(&mut new_frames);
        assert!(matches!(&frames[0], Frame::ConnectResponse(r) if r.accepted && r.ack_base == 1));
        assert_eq!(sequences(&frames[1]), vec![2]);
        assert_eq!(sequences(&frames[2]), vec![3]);
        assert!(harness.take_effects().is_empty());

        // The old transport is now stale.
        harness.socket(T, data(2, 0, "late"));
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseTransport(T)]));
    }

    #[test]
    fn test_initiator_resume_waits_for_response() {
        let (mut harness, _frames) = harness(verified(1));
        harness.write(one_way("m1"));
        harness.socket(T, SocketEventKind::TransportClosed);
        harness.take_effects();

        let (replacement, mut new_frames) = SocketTransport::detached(TransportId(2));
        let request = ConnectRequest::verified(Endpoint::new("A", "gate"), Endpoint::new("B", "battle"), 0, 2, 1);
        harness.read(ReadEvent::Resume(ResumeLink {
            transport: replacement,
            role: ResumeRole::Initiate(request),
        }));
        let frames = sent(&mut new_frames);
        let [Frame::ConnectRequest(sent_request)] = &frames[..] else {
            panic!("expected a lone resume request, got {frames:?}");
        };
        assert_eq!(sent_request.sequence_base, 1);
        assert_eq!(sent_request.ack_base, 0);

        harness.write(Payload::Heartbeat(Heartbeat::Ping));
        assert!(sent(&mut new_frames).is_empty());

        let response = ConnectResponse::accept(sent_request.clone(), Endpoint::new("B", "battle"));
        harness.socket(TransportId(2), SocketEventKind::ConnectResponse(response));
        assert!(matches!(
            harness.take_effects().as_slice(),
            [Effect::ResumeConfirmed { attempt: 2, .. }]
        ));
        assert_eq!(sequences(&sent(&mut new_frames)[0]), vec![1]);
    }

    #[test]
    fn test_resume_refused_when_peer_needs_discarded_messages() {
        let (mut harness, _frames) = harness(verified(1));
        harness.write(one_way("m1"));
        harness.write(one_way("m2"));
        harness.socket(T, data(1, 2, "acked both"));
        harness.socket(T, SocketEventKind::TransportClosed);
        harness.take_effects();

        let (replacement, _new_frames) = SocketTransport::detached(TransportId(2));
        let request = ConnectRequest {
            sequence_base: 2,
            ack_base: 0,
            ..ConnectRequest::verified(Endpoint::new("B", "battle"), Endpoint::new("A", "gate"), 0, 2, 1)
        };
        harness.read(ReadEvent::Resume(ResumeLink {
            transport: replacement,
            role: ResumeRole::Accept(ConnectResponse::accept(request, Endpoint::new("A", "gate"))),
        }));
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseSession(_)]));
    }

    #[test]
    fn test_unacked_overflow_closes_session() {
        let (mut harness, _frames) = harness(SessionConfig {
            max_unacked: 2,
            ..verified(1)
        });
        harness.write(one_way("1"));
        harness.write(one_way("2"));
        assert!(harness.take_effects().is_empty());
        harness.write(one_way("3"));
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseSession(_)]));
    }

    #[test]
    fn test_silent_receiver_acknowledges_on_tick() {
        let (mut harness, mut frames) = harness(verified(32));
        for sequence in 1..=3 {
            harness.socket(T, data(sequence, 0, "inbound"));
        }
        assert!(sent(&mut frames).is_empty());

        harness.tick(Instant::now());
        assert_eq!(sent(&mut frames), vec![Frame::Ack { ack: 3 }]);

        harness.tick(Instant::now());
        assert!(sent(&mut frames).is_empty());
    }

    #[test]
    fn test_trusted_receiver_sends_no_bare_acks() {
        let (mut harness, mut frames) = harness(SessionConfig::default());
        harness.socket(T, data(1, 0, "inbound"));
        harness.tick(Instant::now());
        assert!(sent(&mut frames).is_empty());
    }

    #[test]
    fn test_ack_sent_once_half_the_window_is_outstanding() {
        let (mut harness, mut frames) = harness(SessionConfig {
            max_unacked: 8,
            ..verified(32)
        });
        for sequence in 1..=3 {
            harness.socket(T, data(sequence, 0, "inbound"));
        }
        assert!(sent(&mut frames).is_empty());

        harness.socket(T, data(4, 0, "inbound"));
        assert_eq!(sent(&mut frames), vec![Frame::Ack { ack: 4 }]);
    }

    #[test]
    fn test_one_way_stream_keeps_sender_window_open() {
        let config = SessionConfig {
            max_unacked: 64,
            ..verified(1)
        };
        let (mut sender, mut sender_frames) = harness(config.clone());
        let (mut receiver, mut receiver_frames) = harness(config);

        for round in 0..50 {
            for _ in 0..10 {
                sender.write(one_way("tick"));
            }
            for frame in sent(&mut sender_frames) {
                let Frame::Data(wire) = &frame else {
                    panic!("expected data, got {frame:?}");
                };
                receiver.socket(T, data(wire.sequence, wire.ack, "tick"));
            }
            if round % 3 == 0 {
                receiver.tick(Instant::now());
            }
            for frame in sent(&mut receiver_frames) {
                let Frame::Ack { ack } = &frame else {
                    panic!("expected an ack, got {frame:?}");
                };
                sender.socket(T, SocketEventKind::Ack(*ack));
            }
            assert!(sender.take_effects().is_empty(), "sender closed in round {round}");
        }
        assert_eq!(messages(&receiver).len(), 500);
    }

    #[test]
    fn test_ack_frame_prunes_retained_messages() {
        let (mut harness, _frames) = harness(SessionConfig {
            max_unacked: 2,
            ..verified(1)
        });
        harness.write(one_way("1"));
        harness.write(one_way("2"));
        harness.socket(T, SocketEventKind::Ack(2));
        harness.write(one_way("3"));
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_unanswered_resume_drops_replacement() {
        let (mut harness, _frames) = harness(verified(1));
        harness.write(one_way("m1"));
        harness.socket(T, SocketEventKind::TransportClosed);
        harness.take_effects();

        let (replacement, mut new_frames) = SocketTransport::detached(TransportId(2));
        let request = ConnectRequest::verified(Endpoint::new("A", "gate"), Endpoint::new("B", "battle"), 0, 2, 1);
        harness.read(ReadEvent::Resume(ResumeLink {
            transport: replacement,
            role: ResumeRole::Initiate(request),
        }));
        let _ = sent(&mut new_frames);

        let now = Instant::now();
        harness.tick(now);
        assert!(harness.take_effects().is_empty());

        harness.tick(now + SessionConfig::default().verify_timeout + Duration::from_millis(1));
        assert!(matches!(harness.take_effects().as_slice(), [Effect::TransportLost { .. }]));
        assert!(matches!(new_frames.try_recv(), Ok(WriterCommand::Close)));

        // A late answer on the dropped transport is stale.
        let response = ConnectResponse::accept(
            ConnectRequest::verified(Endpoint::new("A", "gate"), Endpoint::new("B", "battle"), 0, 2, 1),
            Endpoint::new("B", "battle"),
        );
        harness.socket(TransportId(2), SocketEventKind::ConnectResponse(response));
        assert!(matches!(
            harness.take_effects().as_slice(),
            [Effect::CloseTransport(TransportId(2))]
        ));
    }

    #[test]
    fn test_local_link_delivers_copies_and_closes_twin() {
        let twin = SessionKey::acceptor(SessionId::new("A|B"));
        let mut harness = Harness::new(SessionConfig::default());
        harness.add(TransferHandler::<String>::new(
            Link::Local(LocalLink {
                id: TransportId(5),
                twin: twin.clone(),
            }),
            &SessionConfig::default(),
        ));

        harness.write(one_way("a"));
        harness.write(one_way("b"));
        harness.flush();
        let effects = harness.take_effects();
        let delivered: Vec<u64> = effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::DeliverLocal {
                    to,
                    event: SocketEvent { transport: TransportId(5), kind: SocketEventKind::Data(m) },
                } if *to == twin => Some(m.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![1, 2]);

        harness.close();
        assert!(matches!(harness.take_effects().as_slice(), [Effect::CloseSession(k)] if *k == twin));
    }

    #[test]
    fn test_active_and_inactive_notify_application() {
        let (mut harness, _frames) = harness(SessionConfig::default());
        harness.active();
        harness.inactive();
        let events = harness.app_events();
        assert!(matches!(
            events.as_slice(),
            [AppEvent::Connected(handle), AppEvent::Disconnected { remote: Some(_), .. }]
                if handle.remote_identity().id == "B"
        ));
    }
}
