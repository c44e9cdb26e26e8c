use crate::capture::{TrackId, VideoTrack};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport rejected the track: {0}")]
    Rejected(String),

    #[error("transport is closed")]
    Closed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Whether the transport confirmed the old producer is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAck {
    Acknowledged,
    /// The caller must settle for a while before reconnecting.
    Unconfirmed,
}

/// The network-facing producer of the session's outgoing video.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Track currently being sent; `None` until a producer was created.
    fn current_track(&self) -> Option<TrackId>;

    async fn create(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<DisconnectAck, TransportError>;

    async fn connect(&self, track: Arc<dyn VideoTrack>) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    Created,
    Reconnected,
    Unchanged,
}

/// Point the transport at `track`.
///
/// Reconnecting over a live producer duplicates it, so an existing producer
/// with a different track is always disconnected first, then given `settle`
/// unless the transport acknowledged the disconnect.
pub async fn renegotiate(
    transport: &dyn OutboundTransport,
    track: Arc<dyn VideoTrack>,
    settle: Duration,
) -> Result<Renegotiation, TransportError> {
    match transport.current_track() {
        None => {
            tracing::info!("Creating outbound producer with {}", track.id());
            transport.create(track).await?;
            Ok(Renegotiation::Created)
        }
        Some(current) if current == track.id() => {
            tracing::debug!("Outbound producer already sends {}", current);
            Ok(Renegotiation::Unchanged)
        }
        Some(current) => {
            tracing::info!("Switching outbound producer from {} to {}", current, track.id());
            if transport.disconnect().await? == DisconnectAck::Unconfirmed {
                tokio::time::sleep(settle).await;
            }
            transport.connect(track).await?;
            Ok(Renegotiation::Reconnected)
        }
    }
}
