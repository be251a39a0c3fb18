//! Multi-subscriber session channel
//!
//! A [`SessionChannel`] fans one message out to every registered
//! [`Endpoint`]. Each endpoint is a bounded queue, so delivery to one
//! subscriber is FIFO across broadcasts and never blocks the sender:
//!
//! - a closed endpoint (receiver dropped) is a terminated subscriber: it is
//!   removed and the owner gets [`ChannelNotice::SubscriberLost`]
//! - a full endpoint is a transient failure: the subscriber stays and the
//!   owner gets [`ChannelNotice::DeliveryFailed`]; retrying is up to the owner
//!
//! The subscriber set is guarded by a mutex and snapshotted before delivery,
//! so registration may race with an in-flight broadcast.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default queue depth for an endpoint
pub const DEFAULT_ENDPOINT_CAPACITY: usize = 64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber#{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("target terminated")]
    Terminated,
    #[error("transient delivery failure")]
    Transient,
}

/// Delivery problems reported to the channel owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelNotice {
    SubscriberLost(SubscriberId),
    DeliveryFailed(SubscriberId),
}

/// Sending half of one subscriber's queue
///
/// Clones share identity: registering a clone of an already registered
/// endpoint is a no-op.
pub struct Endpoint<M> {
    id: SubscriberId,
    tx: mpsc::Sender<M>,
}

impl<M> Endpoint<M> {
    /// Create an endpoint and the receiver its owner reads from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Queue one message without waiting
    pub fn deliver(&self, msg: M) -> Result<(), DeliveryError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DeliveryError::Transient),
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Terminated),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M> Clone for Endpoint<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl<M> fmt::Debug for Endpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Broadcast channel from one owner to a set of subscribers
pub struct SessionChannel<M> {
    name: String,
    subscribers: Mutex<HashMap<SubscriberId, Endpoint<M>>>,
    notices: Option<mpsc::UnboundedSender<ChannelNotice>>,
}

impl<M: Clone> SessionChannel<M> {
    /// Channel without owner notifications
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscribers: Mutex::new(HashMap::new()),
            notices: None,
        }
    }

    /// Channel that reports lost subscribers and failed deliveries
    pub fn with_notices(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ChannelNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channel = Self::new(name);
        channel.notices = Some(tx);
        (channel, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a subscriber; returns false if it was already registered
    pub fn register(&self, endpoint: Endpoint<M>) -> bool {
        let id = endpoint.id();
        let added = self.lock().insert(id, endpoint).is_none();
        if added {
            debug!("{} registered on {} channel", id, self.name);
        }
        added
    }

    /// Drop every subscriber
    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Deliver `msg` to every current subscriber
    ///
    /// Returns the number of successful deliveries.
    pub fn broadcast(&self, msg: M) -> usize {
        let targets: Vec<Endpoint<M>> = self.lock().values().cloned().collect();
        let mut delivered = 0;

        for endpoint in targets {
            match endpoint.deliver(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Terminated) => {
                    if self.lock().remove(&endpoint.id()).is_some() {
                        warn!("{} on {} channel is dead, removing it", endpoint.id(), self.name);
                        self.notify(ChannelNotice::SubscriberLost(endpoint.id()));
                    }
                }
                Err(DeliveryError::Transient) => {
                    warn!(
                        "Sending a message to {} on {} channel failed: queue full",
                        endpoint.id(),
                        self.name
                    );
                    self.notify(ChannelNotice::DeliveryFailed(endpoint.id()));
                }
            }
        }

        delivered
    }

    fn notify(&self, notice: ChannelNotice) {
        if let Some(tx) = &self.notices {
            if tx.send(notice).is_err() {
                debug!("Owner of {} channel stopped listening for notices", self.name);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriberId, Endpoint<M>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
