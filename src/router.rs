//! Call-signaling router.
//!
//! A connection moves through `UNAUTHENTICATED -> REGISTERED -> UNREGISTERED`.
//! [`SignalRouter::authenticate`] gates the first step, [`SignalRouter::open`]
//! performs it and [`SignalRouter::close`] ends it. In between, every frame
//! the client sends goes through [`SignalRouter::route`], which stamps the
//! channel-bound identity onto it and forwards it to the named recipient.
//!
//! The router keeps no call state. Delivery is best effort; nothing is ever
//! reported back to the sender.

use std::collections::HashSet;
use std::sync::Arc;

use clap::ValueEnum;
use tracing::{debug, info, warn};

use crate::auth::TokenVerifier;
use crate::error::{HandshakeError, MalformedMessage, SendFailure};
use crate::protocol::{HangupReason, Identity, InboundSignal, ServerEvent};
use crate::registry::{ChannelHandle, Frame, Registry};

/// Largest client message routed by default. Session descriptions with
/// many media sections stay well below this.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Who hears about a disconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum HangupNotice {
    Off,
    /// Identities this connection sent signals to.
    #[default]
    Peers,
    /// Every other registered identity.
    All,
}

/// Outcome of routing one inbound frame.
#[derive(Debug)]
pub enum Delivery {
    Delivered,
    RecipientUnavailable,
    Malformed(MalformedMessage),
    Dropped(SendFailure),
    /// The connection's identity has been taken over by a newer channel.
    Superseded,
}

/// One registered channel as seen from its own reader loop.
#[derive(Debug)]
pub struct Connection {
    identity: Identity,
    channel: ChannelHandle,
    peers: HashSet<Identity>,
}

impl Connection {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }
}

pub struct SignalRouter {
    registry: Registry,
    verifier: Arc<dyn TokenVerifier>,
    hangup: HangupNotice,
    max_message_bytes: usize,
}

impl SignalRouter {
    pub fn new(verifier: Arc<dyn TokenVerifier>, hangup: HangupNotice) -> Self {
        Self {
            registry: Registry::new(),
            verifier,
            hangup,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Drop (rather than route) client messages longer than `limit` bytes.
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn authenticate(&self, token: &str) -> Result<Identity, HandshakeError> {
        self.verifier.verify(token)
    }

    /// Register `channel` under `identity` and greet it. Returns the
    /// connection plus any different channel that held the identity before;
    /// the caller owns closing that one.
    pub fn open(
        &self,
        identity: Identity,
        channel: ChannelHandle,
    ) -> (Connection, Option<ChannelHandle>) {
        let displaced = self
            .registry
            .register(identity.clone(), channel.clone())
            .filter(|old| old.id() != channel.id());

        match &displaced {
            Some(old) => info!(
                identity = %identity,
                channel = %channel.id(),
                replaced = %old.id(),
                "channel registered, replacing previous"
            ),
            None => info!(identity = %identity, channel = %channel.id(), "channel registered"),
        }

        let greeting = ServerEvent::Identified {
            id: identity.clone(),
        };
        if let Err(err) = channel.send(Frame(greeting.to_json())) {
            warn!(identity = %identity, error = %err, "failed to queue greeting");
        }

        (
            Connection {
                identity,
                channel,
                peers: HashSet::new(),
            },
            displaced,
        )
    }

    /// Attribute one client frame to `conn` and forward it.
    pub fn route(&self, conn: &mut Connection, text: &str) -> Delivery {
        if !self.registry.is_current(&conn.identity, conn.channel.id()) {
            debug!(identity = %conn.identity, "dropping frame from superseded channel");
            return Delivery::Superseded;
        }

        if text.len() > self.max_message_bytes {
            let err = MalformedMessage::TooLarge {
                size: text.len(),
                max: self.max_message_bytes,
            };
            debug!(identity = %conn.identity, error = %err, "dropping oversized message");
            return Delivery::Malformed(err);
        }

        let signal = match InboundSignal::parse(text) {
            Ok(signal) => signal,
            Err(err) => {
                debug!(identity = %conn.identity, error = %err, "dropping malformed message");
                return Delivery::Malformed(err);
            }
        };

        if let Some(claimed) = &signal.claimed_sender {
            if claimed.as_str() != Some(conn.identity.as_str()) {
                warn!(
                    identity = %conn.identity,
                    claimed = %claimed,
                    "client-supplied senderId ignored"
                );
            }
        }

        let kind = signal.kind;
        let recipient = signal.recipient.clone();
        let Some(target) = self.registry.lookup(&recipient) else {
            debug!(identity = %conn.identity, recipient = %recipient, kind = %kind, "recipient offline");
            return Delivery::RecipientUnavailable;
        };

        match target.send(Frame(signal.attribute(&conn.identity))) {
            Ok(()) => {
                debug!(identity = %conn.identity, recipient = %recipient, kind = %kind, "signal forwarded");
                conn.peers.insert(recipient);
                Delivery::Delivered
            }
            Err(SendFailure::Closed) => {
                warn!(recipient = %recipient, kind = %kind, "recipient channel closed, unregistering");
                self.registry.release(&recipient, target.id());
                Delivery::RecipientUnavailable
            }
            Err(err) => {
                warn!(recipient = %recipient, kind = %kind, error = %err, "signal dropped");
                Delivery::Dropped(err)
            }
        }
    }

    /// Unregister `conn` and send advisory `call-ended` notices. A
    /// connection that was superseded leaves the newer registration alone
    /// and notifies nobody.
    pub fn close(&self, conn: Connection) {
        if !self.registry.release(&conn.identity, conn.channel.id()) {
            debug!(identity = %conn.identity, channel = %conn.channel.id(), "superseded channel closed");
            return;
        }
        info!(identity = %conn.identity, channel = %conn.channel.id(), "channel unregistered");

        let targets: Vec<Identity> = match self.hangup {
            HangupNotice::Off => return,
            HangupNotice::Peers => conn.peers.into_iter().collect(),
            HangupNotice::All => self.registry.identities(),
        };

        let notice = ServerEvent::CallEnded {
            sender_id: conn.identity.clone(),
            reason: HangupReason::Disconnected,
        }
        .to_json();

        for peer in targets.into_iter().filter(|p| *p != conn.identity) {
            if let Some(channel) = self.registry.lookup(&peer) {
                if let Err(err) = channel.send(Frame(notice.clone())) {
                    debug!(peer = %peer, error = %err, "hang-up notice not delivered");
                }
            }
        }
    }
}
