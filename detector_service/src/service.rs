use crate::{
    callback::{report, DetectorCallback, MessageLevel},
    config::{DetectorConfig, RunSetConfig},
    decoder::{FileImageDecoder, ImageDecoder},
    error::DetectorError,
    model_service::ModelService,
    models::ModelManager,
    paths::{FilePath, PathResolver},
    processor,
    results::ResultSet,
    runset::{JobDescription, RunSetConstraints, RunSetIterator},
    sandbox::{ClientName, SandboxManager},
    stop_signal::{wait_completed, StopSignal},
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Connection name of the sandbox the start-up model is unpacked into.
const DEFAULT_CLIENT: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Starting,
    Ready,
    Initializing,
    Processing,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorProperties {
    pub verbosity: MessageLevel,
    pub constraints: RunSetConstraints,
}

/// Returns the service to `Ready` when a job or an explicit initialize ends,
/// unless shutdown moved it on in the meantime.
struct BusyGuard<'a> {
    state: &'a Mutex<LifecycleState>,
    stop: &'a StopSignal,
    busy: LifecycleState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        self.stop.complete();
        if *state == self.busy {
            *state = LifecycleState::Ready;
        }
    }
}

pub struct DetectorService<M: ModelService> {
    config: DetectorConfig,
    runset: RunSetConfig,
    resolver: PathResolver,
    models: ModelManager<M>,
    decoder: Arc<dyn ImageDecoder>,
    state: Mutex<LifecycleState>,
    model: RwLock<Option<Arc<M::Model>>>,
    stop: StopSignal,
}

impl<M: ModelService> DetectorService<M> {
    pub fn new(model_service: M, config: DetectorConfig, runset: RunSetConfig) -> Self {
        let resolver = PathResolver::new(config.data_dir.clone(), config.allow_absolute_paths);
        let models = ModelManager::new(
            model_service,
            SandboxManager::new(config.sandbox_dir.clone()),
        );

        Self {
            config,
            runset,
            resolver,
            models,
            decoder: Arc::new(FileImageDecoder),
            state: Mutex::new(LifecycleState::Uninitialized),
            model: RwLock::new(None),
            stop: StopSignal::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn description(&self) -> &str {
        &self.config.description
    }

    pub fn properties(&self) -> DetectorProperties {
        DetectorProperties {
            verbosity: self.config.verbosity,
            constraints: self.default_constraints(),
        }
    }

    pub fn default_constraints(&self) -> RunSetConstraints {
        RunSetConstraints::from(&self.runset)
    }

    pub fn client_name(&self, connection: &str) -> ClientName {
        ClientName::new(&self.config.name, connection)
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        self.models.sandboxes()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_initialized(&self) -> bool {
        self.model.read().is_some()
    }

    /// Loads the configured default model, if any. A failure only leaves the
    /// service without a model; it still becomes ready.
    pub fn starting(&self) {
        *self.state.lock() = LifecycleState::Starting;

        if let Some(path) = self.config.get_default_model_path() {
            let client = self.client_name(DEFAULT_CLIENT);
            match self.models.load_package(&client, &path) {
                Ok(model) => {
                    *self.model.write() = Some(Arc::new(model));
                    tracing::info!("Default model {:?} loaded", path);
                }
                Err(e) => tracing::warn!("Default model unavailable: {}", e),
            }
        }

        *self.state.lock() = LifecycleState::Ready;
        tracing::info!("{} ready", self.config.name);
    }

    pub fn initialize(
        &self,
        client: &ClientName,
        model: Option<&FilePath>,
    ) -> Result<(), DetectorError> {
        let _guard = self.enter(LifecycleState::Initializing)?;
        self.establish_model(client, model).map(|_| ())
    }

    /// Runs one job to completion or cancellation. Failures before the first
    /// item are relayed to the callback as errors and returned.
    pub fn process(
        &self,
        client: &ClientName,
        job: JobDescription,
        model: Option<&FilePath>,
        callback: &dyn DetectorCallback,
    ) -> Result<ResultSet, DetectorError> {
        self.try_process(client, job, model, callback)
            .inspect_err(|e| report(callback, MessageLevel::Error, &e.to_string()))
    }

    fn try_process(
        &self,
        client: &ClientName,
        job: JobDescription,
        model: Option<&FilePath>,
        callback: &dyn DetectorCallback,
    ) -> Result<ResultSet, DetectorError> {
        let _guard = self.enter(LifecycleState::Processing)?;
        let model = self.establish_model(client, model)?;

        let mut items = RunSetIterator::build(job, &self.resolver);
        if items.init_failed() {
            return Err(DetectorError::EmptyOrInvalidJobDescription);
        }

        tracing::info!("Processing job for {}", client);
        Ok(processor::run(
            &mut items,
            model.as_ref(),
            self.decoder.as_ref(),
            &self.stop,
            callback,
        ))
    }

    /// Asks the running job to stop and waits for it to acknowledge.
    pub async fn cancel(&self) -> bool {
        let receiver = {
            let state = self.state.lock();
            if *state != LifecycleState::Processing {
                tracing::debug!("Cancel ignored: no job in flight");
                return false;
            }
            self.stop.request()
        };

        let timeout = self.config.cancel_timeout();
        if wait_completed(receiver, timeout).await {
            tracing::info!("Job cancelled");
            true
        } else {
            tracing::warn!("{}", DetectorError::CancelTimeout(timeout));
            false
        }
    }

    pub fn stopping(&self) {
        let mut state = self.state.lock();
        if *state == LifecycleState::Processing {
            self.stop.request();
        }
        *state = LifecycleState::Stopping;
    }

    /// Releases the model and ends every client session.
    pub fn destroy(&self) {
        *self.state.lock() = LifecycleState::Stopped;
        if self.model.write().take().is_some() {
            tracing::info!("Model released");
        }
        let cleared = self.sandboxes().clear_all();
        if cleared > 0 {
            tracing::info!("Cleared {} client sandboxes", cleared);
        }
    }

    fn enter(&self, busy: LifecycleState) -> Result<BusyGuard<'_>, DetectorError> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Ready => {}
            LifecycleState::Starting
            | LifecycleState::Initializing
            | LifecycleState::Processing => return Err(DetectorError::Busy),
            LifecycleState::Uninitialized
            | LifecycleState::Stopping
            | LifecycleState::Stopped => return Err(DetectorError::NotRunning),
        }
        *state = busy;
        self.stop.clear();

        Ok(BusyGuard {
            state: &self.state,
            stop: &self.stop,
            busy,
        })
    }

    /// An explicit reference wins and replaces the loaded model once it has
    /// loaded; otherwise the loaded model is reused.
    fn establish_model(
        &self,
        client: &ClientName,
        model: Option<&FilePath>,
    ) -> Result<Arc<M::Model>, DetectorError> {
        if let Some(reference) = model.filter(|reference| !reference.filename.is_empty()) {
            let path = self.resolver.resolve(reference)?;
            let loaded = Arc::new(self.models.load_package(client, &path)?);
            *self.model.write() = Some(loaded.clone());
            return Ok(loaded);
        }

        self.model
            .read()
            .clone()
            .ok_or(DetectorError::NoModelAvailable)
    }
}
