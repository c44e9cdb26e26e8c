use crate::background::{BackgroundSelection, ResolvedBackground};
use crate::capture::Frame;

/// Where the background workflow stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyState {
    #[default]
    Idle,
    /// A preview is being composited.
    Previewing,
    /// A composite is running but not yet sent.
    Applied,
    /// The composite is what the transport sends.
    Committed,
}

/// Values restored when a preview fails.
#[derive(Debug, Clone)]
pub(crate) struct Checkpoint {
    apply: ApplyState,
    selection: BackgroundSelection,
}

/// Everything the workflow tracks between calls. Only the transition
/// methods below change it.
#[derive(Debug)]
pub(crate) struct WorkflowState {
    pub(crate) apply: ApplyState,
    pub(crate) selection: BackgroundSelection,
    pending: ResolvedBackground,
    committed: Option<ResolvedBackground>,
    committed_selection: BackgroundSelection,
    pub(crate) background_has_changed: bool,
    pub(crate) keep_background: bool,
    pub(crate) prev_keep_background: bool,
    pub(crate) deferred_apply: bool,
}

impl WorkflowState {
    pub(crate) fn new(keep_background: bool) -> Self {
        Self {
            apply: ApplyState::Idle,
            selection: BackgroundSelection::None,
            pending: ResolvedBackground::None,
            committed: None,
            committed_selection: BackgroundSelection::None,
            background_has_changed: false,
            keep_background,
            prev_keep_background: false,
            deferred_apply: false,
        }
    }

    fn refresh_changed(&mut self) {
        self.background_has_changed = self.selection != self.committed_selection;
    }

    pub(crate) fn is_applied(&self) -> bool {
        matches!(self.apply, ApplyState::Applied | ApplyState::Committed)
    }

    /// Camera is off: remember the selection and apply it once the camera
    /// comes on.
    pub(crate) fn defer(&mut self, selection: BackgroundSelection) {
        self.selection = selection;
        self.refresh_changed();
        self.deferred_apply = !self.selection.is_none();
    }

    pub(crate) fn defer_commit(&mut self) {
        if !self.selection.is_none() {
            self.deferred_apply = true;
        }
    }

    pub(crate) fn begin_preview(&mut self, selection: BackgroundSelection) -> Checkpoint {
        let checkpoint = Checkpoint {
            apply: self.apply,
            selection: std::mem::replace(&mut self.selection, selection),
        };
        self.apply = ApplyState::Previewing;
        self.deferred_apply = false;
        checkpoint
    }

    pub(crate) fn finish_preview(&mut self, resolved: ResolvedBackground, composited: bool) {
        self.pending = resolved;
        self.apply = if composited {
            ApplyState::Applied
        } else {
            ApplyState::Idle
        };
        self.refresh_changed();
    }

    /// Undo a failed preview. `composite_running` tells whether the previous
    /// composite survived the attempt.
    pub(crate) fn abort_preview(&mut self, checkpoint: Checkpoint, composite_running: bool) {
        self.selection = checkpoint.selection;
        self.apply = match checkpoint.apply {
            ApplyState::Applied | ApplyState::Committed if composite_running => checkpoint.apply,
            _ => ApplyState::Idle,
        };
        self.refresh_changed();
    }

    /// No model: the plain camera stays the effective output.
    pub(crate) fn fall_back_to_camera(&mut self) {
        self.selection = BackgroundSelection::None;
        self.pending = ResolvedBackground::None;
        self.apply = ApplyState::Idle;
        self.refresh_changed();
    }

    /// Same background, same keep decision, already sent.
    pub(crate) fn is_redundant_commit(&self) -> bool {
        self.apply == ApplyState::Committed
            && !self.background_has_changed
            && self.keep_background
            && self.prev_keep_background
    }

    pub(crate) fn commit(&mut self, composited: bool) {
        self.apply = if composited {
            ApplyState::Committed
        } else {
            ApplyState::Idle
        };
        self.prev_keep_background = self.keep_background;
        self.committed_selection = self.selection.clone();
        self.committed = composited.then(|| self.pending.clone());
        self.background_has_changed = false;
    }

    pub(crate) fn has_committed_background(&self) -> bool {
        self.committed.is_some()
    }

    pub(crate) fn committed_image(&self) -> Option<Frame> {
        self.committed
            .as_ref()
            .and_then(|committed| committed.image().cloned())
    }

    /// Drop an uncommitted preview and go back to what the transport sends.
    pub(crate) fn revert_to_committed(&mut self) {
        self.selection = self.committed_selection.clone();
        match &self.committed {
            Some(committed) => {
                self.pending = committed.clone();
                self.apply = ApplyState::Committed;
            }
            None => {
                self.pending = ResolvedBackground::None;
                self.apply = ApplyState::Idle;
            }
        }
        self.background_has_changed = false;
    }

    /// Capture track and composite were torn down. The selection and the
    /// deferred flag survive so the background can come back later.
    pub(crate) fn released(&mut self) {
        self.apply = ApplyState::Idle;
        self.pending = ResolvedBackground::None;
        self.committed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Arc;

    fn custom(name: &str) -> BackgroundSelection {
        BackgroundSelection::CustomImage {
            data_url: name.to_string(),
        }
    }

    fn resolved(name: &str) -> ResolvedBackground {
        ResolvedBackground::Image {
            selection: custom(name),
            image: Arc::new(RgbImage::new(1, 1)),
        }
    }

    fn committed(name: &str) -> WorkflowState {
        let mut state = WorkflowState::new(true);
        state.begin_preview(custom(name));
        state.finish_preview(resolved(name), true);
        state.commit(true);
        state
    }

    #[test]
    fn preview_then_commit() {
        let mut state = WorkflowState::new(true);
        state.begin_preview(custom("beach"));
        assert_eq!(state.apply, ApplyState::Previewing);

        state.finish_preview(resolved("beach"), true);
        assert_eq!(state.apply, ApplyState::Applied);
        assert!(state.background_has_changed);

        state.commit(true);
        assert_eq!(state.apply, ApplyState::Committed);
        assert!(!state.background_has_changed);
        assert!(state.prev_keep_background);
        assert!(state.has_committed_background());
    }

    #[test]
    fn unchanged_commit_is_redundant() {
        let state = committed("beach");
        assert!(state.is_redundant_commit());
    }

    #[test]
    fn keep_flag_change_is_not_redundant() {
        let mut state = committed("beach");
        state.keep_background = false;
        assert!(!state.is_redundant_commit());
    }

    #[test]
    fn new_selection_is_not_redundant() {
        let mut state = committed("beach");
        state.begin_preview(custom("forest"));
        state.finish_preview(resolved("forest"), true);
        assert!(!state.is_redundant_commit());
    }

    #[test]
    fn failed_preview_restores_previous_state() {
        let mut state = committed("beach");
        let checkpoint = state.begin_preview(custom("forest"));
        state.abort_preview(checkpoint, true);

        assert_eq!(state.apply, ApplyState::Committed);
        assert_eq!(state.selection, custom("beach"));
        assert!(!state.background_has_changed);
    }

    #[test]
    fn failed_preview_without_composite_is_idle() {
        let mut state = committed("beach");
        let checkpoint = state.begin_preview(custom("forest"));
        state.abort_preview(checkpoint, false);
        assert_eq!(state.apply, ApplyState::Idle);
    }

    #[test]
    fn defer_only_flags_real_backgrounds() {
        let mut state = WorkflowState::new(true);
        state.defer(BackgroundSelection::None);
        assert!(!state.deferred_apply);

        state.defer(custom("beach"));
        assert!(state.deferred_apply);
        assert_eq!(state.apply, ApplyState::Idle);

        state.begin_preview(custom("beach"));
        assert!(!state.deferred_apply);
    }

    #[test]
    fn revert_discards_uncommitted_preview() {
        let mut state = committed("beach");
        state.begin_preview(custom("forest"));
        state.finish_preview(resolved("forest"), true);

        state.revert_to_committed();
        assert_eq!(state.selection, custom("beach"));
        assert_eq!(state.apply, ApplyState::Committed);
        assert!(state.committed_image().is_some());
    }

    #[test]
    fn release_keeps_selection() {
        let mut state = committed("beach");
        state.released();
        assert_eq!(state.apply, ApplyState::Idle);
        assert_eq!(state.selection, custom("beach"));
        assert!(!state.has_committed_background());
    }
}
