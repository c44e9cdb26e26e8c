use super::types::SegmentationModel;
use crate::error::BackgroundError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Handle to the loaded model shared by every consumer.
pub type SharedModel = Arc<Mutex<Box<dyn SegmentationModel>>>;

/// Produces a fresh model instance. Called at most once per load attempt.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> anyhow::Result<Box<dyn SegmentationModel>>;
}

type LoadOutcome = Result<SharedModel, String>;

enum Slot {
    Empty,
    Loading {
        id: u64,
        pending: watch::Receiver<Option<LoadOutcome>>,
    },
    Loaded(SharedModel),
}

struct Inner {
    slot: Slot,
    /// Bumped by `destroy`; loads started before it never install their model.
    epoch: u64,
    next_load: u64,
    destroyed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStatus {
    pub loaded: bool,
    pub loading: bool,
    pub destroyed: bool,
}

/// Process-wide owner of the segmentation model.
///
/// Construct one at startup and hand the `Arc` to every consumer. The model
/// is loaded lazily on the first [`get_model`](Self::get_model); callers
/// arriving while that load is in flight wait on the same load. A load runs
/// on its own task and finishes even if every caller stops waiting.
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    inner: Mutex<Inner>,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Arc<Self> {
        Arc::new(Self {
            loader,
            inner: Mutex::new(Inner {
                slot: Slot::Empty,
                epoch: 0,
                next_load: 0,
                destroyed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared model, loading it if needed.
    ///
    /// A failed load leaves the manager empty so a later call retries; retry
    /// scheduling is the caller's business.
    pub async fn get_model(self: &Arc<Self>) -> Result<SharedModel, BackgroundError> {
        let mut pending = {
            let mut inner = self.lock();
            match &inner.slot {
                Slot::Loaded(model) => return Ok(Arc::clone(model)),
                Slot::Loading { pending, .. } => pending.clone(),
                Slot::Empty => self.start_load(&mut inner),
            }
        };

        let outcome = match pending.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };

        match outcome {
            Some(Ok(model)) => Ok(model),
            Some(Err(message)) => Err(BackgroundError::ModelUnavailable(message)),
            None => Err(BackgroundError::ModelUnavailable(
                "model load was abandoned".to_string(),
            )),
        }
    }

    fn start_load(self: &Arc<Self>, inner: &mut Inner) -> watch::Receiver<Option<LoadOutcome>> {
        inner.destroyed = false;
        inner.next_load += 1;
        let id = inner.next_load;
        let epoch = inner.epoch;

        let (done, pending) = watch::channel(None);
        inner.slot = Slot::Loading {
            id,
            pending: pending.clone(),
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Loading segmentation model");
            let outcome = match manager.loader.load().await {
                Ok(model) => {
                    let (width, height) = model.input_size();
                    tracing::info!("Segmentation model ready ({}x{} input)", width, height);
                    Ok(Arc::new(Mutex::new(model)))
                }
                Err(e) => {
                    tracing::warn!("Segmentation model failed to load: {:#}", e);
                    Err(format!("{:#}", e))
                }
            };
            let outcome = manager.finish_load(epoch, id, outcome);
            let _ = done.send(Some(outcome));
        });

        pending
    }

    /// Install the result of load `id` and return what its waiters get.
    ///
    /// A successful load installs itself even after `reset`; only `destroy`
    /// discards it. When another load already installed a model, that model
    /// wins and this one is dropped, so at most one instance stays live.
    fn finish_load(&self, epoch: u64, id: u64, outcome: LoadOutcome) -> LoadOutcome {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            tracing::debug!("Discarding model loaded before destroy");
            return outcome;
        }

        if let Slot::Loaded(existing) = &inner.slot {
            tracing::debug!("Model already installed; dropping duplicate load");
            return Ok(Arc::clone(existing));
        }

        match outcome {
            Ok(model) => {
                inner.slot = Slot::Loaded(Arc::clone(&model));
                Ok(model)
            }
            Err(message) => {
                if matches!(inner.slot, Slot::Loading { id: current, .. } if current == id) {
                    inner.slot = Slot::Empty;
                }
                Err(message)
            }
        }
    }

    /// The loaded model, without starting a load.
    pub fn current(&self) -> Option<SharedModel> {
        match &self.lock().slot {
            Slot::Loaded(model) => Some(Arc::clone(model)),
            _ => None,
        }
    }

    /// Release the model. The next [`get_model`](Self::get_model) loads it
    /// again. Only for application shutdown; closing one surface must not
    /// call this.
    pub fn destroy(&self) {
        let released = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.destroyed = true;
            std::mem::replace(&mut inner.slot, Slot::Empty)
        };
        match released {
            Slot::Loaded(_) => tracing::info!("Segmentation model destroyed"),
            Slot::Loading { .. } => tracing::info!("Segmentation model destroyed while loading"),
            Slot::Empty => {}
        }
    }

    /// Stop new callers from joining an in-flight load; the next
    /// `get_model` starts a fresh one. The old load keeps running and still
    /// installs its model. A loaded model is untouched.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if matches!(inner.slot, Slot::Loading { .. }) {
            tracing::debug!("Detaching in-flight model load");
            inner.slot = Slot::Empty;
        }
    }

    pub fn status(&self) -> ModelStatus {
        let inner = self.lock();
        ModelStatus {
            loaded: matches!(inner.slot, Slot::Loaded(_)),
            loading: matches!(inner.slot, Slot::Loading { .. }),
            destroyed: inner.destroyed,
        }
    }
}
