//! Virtual-background compositing for a conferencing client.
//!
//! The pipeline has four parts, leaves first:
//! - [`segmentation::ModelManager`] loads the body-segmentation model once and
//!   shares it with every consumer.
//! - [`capture::TrackLifecycle`] owns the cloned camera track the compositor
//!   reads from.
//! - [`compositor::Compositor`] runs the per-frame mask-and-composite loop and
//!   exposes the drawing surface as an output track.
//! - [`workflow::BackgroundWorkflow`] drives preview and commit, including the
//!   renegotiation of the outbound transport.

pub mod background;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod error;
pub mod output;
pub mod resolution;
pub mod segmentation;
pub mod session;
pub mod workflow;

pub use background::{BackgroundImageSource, BackgroundSelection, FsImageSource, ResolvedBackground};
pub use config::BackdropConfig;
pub use error::BackgroundError;
pub use resolution::ResolutionTier;
pub use session::{Alerter, MediaKind, RecordingState, SessionView, Severity, TracingAlerter};
pub use workflow::{ApplyState, BackgroundWorkflow, Collaborators};
