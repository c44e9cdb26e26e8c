//! Preview, save and cancel of a virtual background.
//!
//! The workflow owns the capture track and the compositor and decides what
//! the outbound transport sends: the composite output when a background is
//! kept, the plain camera otherwise.

mod state;
mod transport;

pub use state::ApplyState;
pub use transport::{renegotiate, DisconnectAck, OutboundTransport, Renegotiation, TransportError};

use crate::background::{self, BackgroundImageSource, BackgroundSelection, ResolvedBackground};
use crate::capture::{CaptureDevice, TeardownContext, TrackLifecycle, VideoTrack};
use crate::compositor::{CompositeOutput, Compositor, CompositorConfig};
use crate::config::BackdropConfig;
use crate::error::BackgroundError;
use crate::segmentation::ModelManager;
use crate::session::{Alerter, SessionView};
use state::WorkflowState;
use std::sync::Arc;

/// Everything outside the pipeline the workflow talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub device: Arc<dyn CaptureDevice>,
    pub session: Arc<dyn SessionView>,
    pub transport: Arc<dyn OutboundTransport>,
    pub alerter: Arc<dyn Alerter>,
    pub images: Arc<dyn BackgroundImageSource>,
}

pub struct BackgroundWorkflow {
    config: BackdropConfig,
    session: Arc<dyn SessionView>,
    transport: Arc<dyn OutboundTransport>,
    alerter: Arc<dyn Alerter>,
    images: Arc<dyn BackgroundImageSource>,
    lifecycle: TrackLifecycle,
    compositor: Compositor,
    state: WorkflowState,
}

impl BackgroundWorkflow {
    pub fn new(config: BackdropConfig, models: Arc<ModelManager>, collaborators: Collaborators) -> Self {
        let Collaborators {
            device,
            session,
            transport,
            alerter,
            images,
        } = collaborators;

        let lifecycle = TrackLifecycle::new(device, Arc::clone(&session), config.constraints.clone());
        let compositor = Compositor::new(models, CompositorConfig::from(&config));
        let state = WorkflowState::new(config.keep_background);

        Self {
            config,
            session,
            transport,
            alerter,
            images,
            lifecycle,
            compositor,
            state,
        }
    }

    /// Show `selection` behind the person without sending it anywhere.
    ///
    /// With the camera off the selection is remembered and applied by
    /// [`on_camera_started`](Self::on_camera_started).
    pub async fn preview_background(
        &mut self,
        selection: BackgroundSelection,
    ) -> Result<(), BackgroundError> {
        self.check_audio_only()?;

        if !self.session.camera_on() {
            tracing::info!("Camera is off; background will be applied when it starts");
            self.state.defer(selection);
            return Ok(());
        }

        let resolved =
            match background::resolve(&selection, self.images.as_ref(), self.config.resolution_tier)
                .await
            {
                Ok(resolved) => resolved,
                Err(e) => return Err(self.report(e)),
            };

        let checkpoint = self.state.begin_preview(selection);
        match self.run_preview(&resolved).await {
            Ok(composited) => {
                tracing::info!(
                    "Previewing {}",
                    if composited { "background" } else { "plain camera" }
                );
                self.state.finish_preview(resolved, composited);
                Ok(())
            }
            Err(BackgroundError::ModelUnavailable(reason)) => {
                self.compositor.clear();
                self.state.fall_back_to_camera();
                if !self.state.has_committed_background() {
                    self.lifecycle.release();
                }
                Err(self.report(BackgroundError::ModelUnavailable(reason)))
            }
            Err(e) => {
                let running = self.compositor.output().is_some_and(|output| output.is_live());
                self.state.abort_preview(checkpoint, running);
                if !self.state.is_applied() {
                    self.compositor.clear();
                    self.lifecycle.release();
                }
                Err(self.report(e))
            }
        }
    }

    /// Returns whether a composite is now running.
    async fn run_preview(&mut self, resolved: &ResolvedBackground) -> Result<bool, BackgroundError> {
        if resolved.image().is_none() {
            self.compositor.clear();
            return Ok(false);
        }

        let use_existing_camera_track = self.session.camera_track().is_some();
        let track = self
            .lifecycle
            .acquire_capture_track(use_existing_camera_track)
            .await?;
        let output = self.compositor.composite(track, resolved).await?;
        Ok(output.is_some())
    }

    /// Send the previewed background (or the plain camera) to the transport.
    pub async fn save_background(&mut self) -> Result<(), BackgroundError> {
        if !self.session.camera_on() {
            self.state.defer_commit();
            return Ok(());
        }

        self.check_audio_only()?;
        if self.session.recording().blocks_background_change() {
            return Err(self.report(BackgroundError::RecordingInProgressRejected));
        }

        if self.state.is_redundant_commit() {
            tracing::debug!("Background unchanged; transport left alone");
            return Ok(());
        }

        let (track, composited) = self.outgoing_track()?;
        let sent = track.id();
        if let Err(e) = renegotiate(self.transport.as_ref(), track, self.config.reconnect_settle).await {
            return Err(self.report(BackgroundError::TransportRenegotiationFailed(e.to_string())));
        }

        self.state.commit(composited);
        if !composited {
            // Nothing reads the composite once the plain camera is sent.
            self.compositor.clear();
            if self.lifecycle.capture_track().is_some_and(|clone| clone.id() != sent) {
                self.lifecycle.release();
            }
        }
        tracing::info!(
            "Committed {}",
            if composited { "background" } else { "plain camera" }
        );
        Ok(())
    }

    /// The composite when it is kept and live, then the camera, then our clone.
    fn outgoing_track(&self) -> Result<(Arc<dyn VideoTrack>, bool), BackgroundError> {
        if self.state.keep_background && self.state.is_applied() {
            if let Some(output) = self.compositor.output().filter(CompositeOutput::is_live) {
                return Ok((output.track(), true));
            }
        }
        if let Some(camera) = self.session.camera_track().filter(|track| track.is_live()) {
            return Ok((camera, false));
        }
        if let Some(clone) = self.lifecycle.capture_track().filter(|track| track.is_live()) {
            return Ok((clone, false));
        }
        Err(self.report(BackgroundError::NoLiveTrack))
    }

    /// Close the background chooser.
    ///
    /// A committed, kept background keeps running while the camera is on; an
    /// uncommitted preview is dropped in favour of it. Anything else stops the
    /// composite and the capture track. A deferred background stays pending.
    pub fn cancel(&mut self) {
        let context = TeardownContext {
            applied: self.state.has_committed_background(),
            kept: self.state.prev_keep_background,
            camera_on: self.session.camera_on(),
        };

        if self.lifecycle.teardown(context) {
            self.compositor.clear();
            self.state.released();
            return;
        }

        if self.state.background_has_changed || self.state.apply != ApplyState::Committed {
            if let Some(image) = self.state.committed_image() {
                tracing::info!("Restoring committed background");
                self.compositor.set_background(image);
            }
            self.state.revert_to_committed();
        }
    }

    /// Apply a background chosen while the camera was off. Returns whether
    /// one was pending.
    pub async fn on_camera_started(&mut self) -> Result<bool, BackgroundError> {
        if !self.state.deferred_apply || !self.session.camera_on() {
            return Ok(false);
        }

        tracing::info!("Camera started; applying deferred background");
        let selection = self.state.selection.clone();
        let result = match self.preview_background(selection).await {
            Ok(()) => self.save_background().await,
            Err(e) => Err(e),
        };
        self.state.deferred_apply = false;
        result.map(|()| true)
    }

    pub fn set_keep_background(&mut self, keep: bool) {
        self.state.keep_background = keep;
    }

    pub fn apply_state(&self) -> ApplyState {
        self.state.apply
    }

    pub fn is_applied(&self) -> bool {
        self.state.is_applied()
    }

    /// A committed background that survives closing the chooser.
    pub fn is_kept(&self) -> bool {
        self.state.apply == ApplyState::Committed && self.state.keep_background
    }

    pub fn current_selection(&self) -> &BackgroundSelection {
        &self.state.selection
    }

    pub fn deferred_apply_pending(&self) -> bool {
        self.state.deferred_apply
    }

    pub fn pause(&self) {
        self.compositor.pause();
    }

    pub fn resume(&self) {
        self.compositor.resume();
    }

    pub fn capture_track(&self) -> Option<Arc<dyn VideoTrack>> {
        self.lifecycle.capture_track()
    }

    pub fn output(&self) -> Option<CompositeOutput> {
        self.compositor.output()
    }

    /// Stop everything regardless of the keep flag.
    pub fn shutdown(&mut self) {
        self.compositor.clear();
        self.lifecycle.release();
        self.state.released();
    }

    fn check_audio_only(&self) -> Result<(), BackgroundError> {
        if self.session.audio_only() {
            return Err(self.report(BackgroundError::AudioOnlyRoomRejected));
        }
        Ok(())
    }

    fn report(&self, error: BackgroundError) -> BackgroundError {
        self.alerter.alert(&error.to_string(), error.severity());
        error
    }
}
