use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::SendFailure;
use crate::protocol::Identity;

/// One serialized JSON message queued for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(pub String);

/// Sending half of one live channel. Cloning is cheap; every clone targets
/// the same socket and shares its `id`.
///
/// Data frames go through a bounded queue. Close requests travel on a
/// separate watch so they still land when that queue is full.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: Uuid,
    tx: mpsc::Sender<Frame>,
    close: Arc<watch::Sender<Option<&'static str>>>,
}

impl ChannelHandle {
    /// Create a channel with room for `capacity` queued frames.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (close, _) = watch::channel(None);
        (
            Self {
                id: Uuid::new_v4(),
                tx,
                close: Arc::new(close),
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a frame without waiting.
    pub fn send(&self, frame: Frame) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => SendFailure::Full,
            TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Ask the socket behind this channel to shut down with `reason`.
    /// Later requests do not overwrite the first one.
    pub fn close(&self, reason: &'static str) {
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Receiver that observes [`ChannelHandle::close`]. A request made
    /// before subscribing is still visible through `wait_for`.
    pub fn close_requested(&self) -> watch::Receiver<Option<&'static str>> {
        self.close.subscribe()
    }
}

/// Identity -> channel lookup. Last writer wins.
#[derive(Debug, Default)]
pub struct Registry {
    channels: DashMap<Identity, ChannelHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `id` with `channel`, returning whatever was there before.
    /// The previous channel is not closed here.
    pub fn register(&self, id: Identity, channel: ChannelHandle) -> Option<ChannelHandle> {
        self.channels.insert(id, channel)
    }

    pub fn lookup(&self, id: &Identity) -> Option<ChannelHandle> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    /// Remove `id` whatever channel it points at. Absent ids are a no-op.
    pub fn unregister(&self, id: &Identity) -> Option<ChannelHandle> {
        self.channels.remove(id).map(|(_, channel)| channel)
    }

    /// Remove `id` only while it still points at `channel`. Returns whether
    /// an entry was removed.
    pub fn release(&self, id: &Identity, channel: Uuid) -> bool {
        self.channels
            .remove_if(id, |_, current| current.id() == channel)
            .is_some()
    }

    /// Whether `id` is currently bound to `channel`.
    pub fn is_current(&self, id: &Identity, channel: Uuid) -> bool {
        self.channels
            .get(id)
            .is_some_and(|entry| entry.value().id() == channel)
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
