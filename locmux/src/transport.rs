//! Client delivery sinks.
//!
//! A transport is the multiplexer's handle to one client: locations (and,
//! for continuous subscriptions, provider enable transitions) go out
//! through it. Delivery runs on the worker thread, never under the
//! multiplexer lock. A [`TransportError::Disconnected`] means the client is
//! gone and the registration removes itself.

use crate::location::Location;
use crate::wakelock::SingleUseCallback;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The remote side is gone (died, cancelled, or hung up).
    #[error("client disconnected")]
    Disconnected,
}

/// Location delivery sink.
pub trait LocationTransport: Send + Sync {
    /// Deliver a location, or `None` when a one-shot request gives up.
    ///
    /// When `on_complete` is present the client should invoke it once it
    /// has finished processing; it backs the delivery wakelock and is safe
    /// to invoke from any thread, any number of times.
    fn deliver_location(
        &self,
        location: Option<Location>,
        on_complete: Option<Arc<SingleUseCallback>>,
    ) -> Result<(), TransportError>;
}

/// Provider enable-transition sink for continuous subscriptions.
pub trait ProviderTransport: Send + Sync {
    fn deliver_provider_enabled(&self, provider: &str, enabled: bool)
        -> Result<(), TransportError>;
}

/// Everything a transport can carry, as plain data.
#[derive(Debug)]
pub enum ClientEvent {
    Location {
        location: Option<Location>,
        on_complete: Option<Arc<SingleUseCallback>>,
    },
    ProviderEnabled {
        provider: String,
        enabled: bool,
    },
}

/// Channel-backed transport: deliveries become [`ClientEvent`]s on the
/// paired receiver. Dropping the receiver makes the transport report
/// [`TransportError::Disconnected`], which is how client death is observed.
pub struct ChannelTransport {
    sender: Sender<ClientEvent>,
}

/// Create a connected transport/receiver pair.
pub fn channel_transport() -> (Arc<ChannelTransport>, Receiver<ClientEvent>) {
    let (sender, receiver) = mpsc::channel();
    (Arc::new(ChannelTransport { sender }), receiver)
}

impl LocationTransport for ChannelTransport {
    fn deliver_location(
        &self,
        location: Option<Location>,
        on_complete: Option<Arc<SingleUseCallback>>,
    ) -> Result<(), TransportError> {
        self.sender
            .send(ClientEvent::Location {
                location,
                on_complete,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}

impl ProviderTransport for ChannelTransport {
    fn deliver_provider_enabled(
        &self,
        provider: &str,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.sender
            .send(ClientEvent::ProviderEnabled {
                provider: provider.to_string(),
                enabled,
            })
            .map_err(|_| TransportError::Disconnected)
    }
}
