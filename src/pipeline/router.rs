//! Routing of incoming remote streams to their consumers
//!
//! Decoding and rendering of the viewer's media is done by external consumers,
//! one per media kind.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::MediaKind;

/// Metadata of a remote track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub kind: MediaKind,
    pub track_id: String,
    /// Codec MIME type negotiated for the track
    pub codec: String,
}

/// A remote track and the queue its payloads arrive on
#[derive(Debug)]
pub struct IncomingStream {
    pub descriptor: StreamDescriptor,
    pub payloads: mpsc::Receiver<Bytes>,
}

/// Decoder/renderer for one kind of remote media
pub trait StreamConsumer: Send + Sync {
    fn attach(&self, stream: IncomingStream);
}

/// Consumer that discards payloads, logging how many were received
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainConsumer;

impl StreamConsumer for DrainConsumer {
    fn attach(&self, stream: IncomingStream) {
        let IncomingStream {
            descriptor,
            mut payloads,
        } = stream;

        tokio::spawn(async move {
            let mut packets = 0u64;
            let mut bytes = 0u64;
            while let Some(payload) = payloads.recv().await {
                packets += 1;
                bytes += payload.len() as u64;
                if packets.is_multiple_of(500) {
                    debug!("{} track {}: {} packets", descriptor.kind, descriptor.track_id, packets);
                }
            }
            info!(
                "{} track {} ended after {} packets ({} bytes)",
                descriptor.kind, descriptor.track_id, packets, bytes
            );
        });
    }
}

/// Consumers keyed by media kind
#[derive(Clone)]
pub struct StreamRouter {
    consumers: HashMap<MediaKind, Arc<dyn StreamConsumer>>,
    fallback: Arc<dyn StreamConsumer>,
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRouter {
    pub fn new() -> Self {
        Self {
            consumers: HashMap::new(),
            fallback: Arc::new(DrainConsumer),
        }
    }

    /// Register the consumer for a media kind
    pub fn with_consumer(mut self, kind: MediaKind, consumer: Arc<dyn StreamConsumer>) -> Self {
        self.consumers.insert(kind, consumer);
        self
    }

    /// Attach a stream to the consumer for its kind.
    ///
    /// Returns false when no consumer is registered and the stream was drained.
    pub fn route(&self, stream: IncomingStream) -> bool {
        info!(
            "Incoming {} stream {} ({})",
            stream.descriptor.kind, stream.descriptor.track_id, stream.descriptor.codec
        );
        match self.consumers.get(&stream.descriptor.kind) {
            Some(consumer) => {
                consumer.attach(stream);
                true
            }
            None => {
                self.fallback.attach(stream);
                false
            }
        }
    }
}
