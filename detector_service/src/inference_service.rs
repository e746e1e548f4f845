use crate::{
    callback::{DetectorCallback, MessageLevel},
    model_service::{Candidate, ModelService},
    paths::FilePath,
    results::{DetectionResult, ResultSet},
    runset::{JobDescription, RunSetEntry},
    sandbox::ClientName,
    service::DetectorService,
};
use detector_proto::{
    detector_server::Detector, process_event::Event, BoundingBox, CancelResponse, ClientMessage,
    DescriptionResponse, DetectorProperties, Empty, InitializeRequest, InitializeResponse,
    InitializedResponse, Label, Labelable, NameResponse, ProcessEvent, ProcessRequest,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{async_trait, Request, Response, Status};

/// Request metadata naming the caller. Falls back to the peer address.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

type EventSender = mpsc::UnboundedSender<Result<ProcessEvent, Status>>;

/// Streams messages and results of one job back to its caller.
struct ChannelCallback {
    sender: EventSender,
    verbosity: MessageLevel,
}

impl DetectorCallback for ChannelCallback {
    fn message(&self, level: MessageLevel, text: &str) {
        if level == MessageLevel::Silent || level > self.verbosity {
            return;
        }
        let event = Event::Message(ClientMessage {
            level: detector_proto::MessageLevel::from(level) as i32,
            text: text.to_string(),
        });
        if self.sender.send(Ok(ProcessEvent { event: Some(event) })).is_err() {
            tracing::debug!("Caller went away, dropping message");
        }
    }

    fn found_new_results(&self, results: &ResultSet) {
        let event = Event::Results(results.into());
        if self.sender.send(Ok(ProcessEvent { event: Some(event) })).is_err() {
            tracing::warn!("Caller went away before {} results were sent", results.len());
        }
    }
}

impl From<&Candidate> for BoundingBox {
    fn from(candidate: &Candidate) -> Self {
        let [x1, y1, x2, y2] = candidate.bbox;
        Self {
            class_id: candidate.class_id,
            confidence: candidate.score,
            x1,
            y1,
            x2,
            y2,
        }
    }
}

impl From<&DetectionResult> for detector_proto::DetectionResult {
    fn from(result: &DetectionResult) -> Self {
        let path = result.item.path.display().to_string();
        let frame_index = result.item.frame_index.map(|index| index as u64);

        let original = Labelable {
            path: path.clone(),
            label: result.item.label.as_ref().map(|name| Label {
                has_label: true,
                name: name.clone(),
            }),
            confidence: 0.0,
            frame_index,
        };
        let found = Labelable {
            path,
            label: Some(Label {
                has_label: result.has_label,
                name: result.outcome.clone(),
            }),
            confidence: result.confidence,
            frame_index,
        };

        Self {
            original: Some(original),
            found_labels: vec![found],
            regions: result.regions.iter().map(BoundingBox::from).collect(),
        }
    }
}

impl From<&ResultSet> for detector_proto::ResultSet {
    fn from(results: &ResultSet) -> Self {
        Self {
            results: results.iter().map(Into::into).collect(),
            cancelled: results.cancelled,
        }
    }
}

pub struct InferenceService<M: ModelService> {
    service: Arc<DetectorService<M>>,
}

impl<M: ModelService> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(service: Arc<DetectorService<M>>) -> Self {
        Self { service }
    }

    fn client<T>(&self, request: &Request<T>) -> ClientName {
        let connection = request
            .metadata()
            .get(CLIENT_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(String::from)
            .or_else(|| request.remote_addr().map(|addr| addr.to_string()))
            .unwrap_or_else(|| "anonymous".to_string());
        self.service.client_name(&connection)
    }

    /// Caller properties override the configured defaults, and the run set's
    /// own constraints override both.
    fn job_description(&self, request: ProcessRequest) -> (JobDescription, MessageLevel) {
        let defaults = self.service.properties();
        let mut constraints = defaults.constraints;
        let mut verbosity = defaults.verbosity;

        if let Some(properties) = request.properties {
            if let Some(level) = properties
                .verbosity
                .and_then(|level| detector_proto::MessageLevel::try_from(level).ok())
            {
                verbosity = level.into();
            }
            if !properties.admitted_types.is_empty() {
                constraints.admitted_types = properties.admitted_types.into_iter().collect();
            }
            if properties.skip_frames > 0 {
                constraints.skip_frames = properties.skip_frames as usize;
            }
        }

        let entries = match request.run_set {
            Some(run_set) => {
                if !run_set.admitted_types.is_empty() {
                    constraints.admitted_types = run_set.admitted_types.into_iter().collect();
                }
                if let Some(skip_frames) = run_set.skip_frames {
                    constraints.skip_frames = skip_frames as usize;
                }
                run_set.entries.into_iter().map(RunSetEntry::from).collect()
            }
            None => Vec::new(),
        };

        (JobDescription::new(entries, constraints), verbosity)
    }
}

#[async_trait]
impl<M: ModelService> Detector for InferenceService<M> {
    #[tracing::instrument(skip(self, request))]
    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> Result<Response<InitializeResponse>, Status> {
        let client = self.client(&request);
        let model = request.into_inner().model.map(FilePath::from);

        let service = self.service.clone();
        let result = tokio::task::spawn_blocking(move || service.initialize(&client, model.as_ref()))
            .await
            .map_err(|e| Status::internal(format!("initialize task failed: {}", e)))?;

        let response = match result {
            Ok(()) => InitializeResponse {
                initialized: true,
                message: "Model initialized".to_string(),
            },
            Err(e) => {
                tracing::warn!("Initialize failed: {}", e);
                InitializeResponse {
                    initialized: false,
                    message: e.to_string(),
                }
            }
        };

        Ok(Response::new(response))
    }

    async fn is_initialized(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<InitializedResponse>, Status> {
        Ok(Response::new(InitializedResponse {
            initialized: self.service.is_initialized(),
        }))
    }

    type ProcessStream = UnboundedReceiverStream<Result<ProcessEvent, Status>>;

    #[tracing::instrument(skip(self, request))]
    async fn process(
        &self,
        request: Request<ProcessRequest>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let client = self.client(&request);
        let request = request.into_inner();
        let model = request.model.clone().map(FilePath::from);
        let (job, verbosity) = self.job_description(request);

        tracing::info!("{} submitted {} run set entries", client, job.entries.len());

        let (sender, receiver) = mpsc::unbounded_channel();
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || {
            let callback = ChannelCallback {
                sender: sender.clone(),
                verbosity,
            };
            if let Err(e) = service.process(&client, job, model.as_ref(), &callback) {
                let _ = sender.send(Err(Status::from(e)));
            }
        });

        Ok(Response::new(UnboundedReceiverStream::new(receiver)))
    }

    #[tracing::instrument(skip(self, _request))]
    async fn cancel(&self, _request: Request<Empty>) -> Result<Response<CancelResponse>, Status> {
        let cancelled = self.service.cancel().await;
        Ok(Response::new(CancelResponse { cancelled }))
    }

    async fn get_name(&self, _request: Request<Empty>) -> Result<Response<NameResponse>, Status> {
        Ok(Response::new(NameResponse {
            name: self.service.name().to_string(),
        }))
    }

    async fn get_description(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DescriptionResponse>, Status> {
        Ok(Response::new(DescriptionResponse {
            description: self.service.description().to_string(),
        }))
    }

    async fn get_detector_properties(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DetectorProperties>, Status> {
        let properties = self.service.properties();
        Ok(Response::new(DetectorProperties {
            verbosity: Some(detector_proto::MessageLevel::from(properties.verbosity) as i32),
            admitted_types: properties.constraints.admitted_types.into_iter().collect(),
            skip_frames: u32::try_from(properties.constraints.skip_frames).unwrap_or(u32::MAX),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{DetectorConfig, RunSetConfig},
        testing::{write_image, write_model_package, MockModelService},
    };
    use detector_proto::{EntryKind, RunSet};
    use tokio_stream::StreamExt;

    fn inference_service(
        data: &std::path::Path,
        default_model: Option<&str>,
    ) -> InferenceService<MockModelService> {
        let mut config =
            DetectorConfig::new("Test_Detector", data.to_path_buf(), data.join("clients"));
        config.default_model = default_model.map(Into::into);
        let service = DetectorService::new(MockModelService, config, RunSetConfig::default());
        service.starting();
        InferenceService::new(Arc::new(service))
    }

    fn run_set() -> RunSet {
        RunSet {
            entries: vec![
                detector_proto::RunSetEntry {
                    kind: EntryKind::File as i32,
                    path: Some(detector_proto::FilePath {
                        directory: "images".to_string(),
                        filename: "a.jpg".to_string(),
                    }),
                    recursive: false,
                    label: Some("ship".to_string()),
                },
                detector_proto::RunSetEntry {
                    kind: EntryKind::Directory as i32,
                    path: Some(detector_proto::FilePath {
                        directory: "more".to_string(),
                        filename: String::new(),
                    }),
                    recursive: false,
                    label: None,
                },
            ],
            admitted_types: vec!["jpg".to_string()],
            skip_frames: None,
        }
    }

    async fn collect(
        service: &InferenceService<MockModelService>,
        request: ProcessRequest,
    ) -> Result<Vec<Result<ProcessEvent, Status>>, Status> {
        let mut request = Request::new(request);
        request
            .metadata_mut()
            .insert(CLIENT_ID_HEADER, "tester".parse().map_err(|_| Status::internal("header"))?);
        let stream = service.process(request).await?.into_inner();
        Ok(stream.collect().await)
    }

    #[tokio::test]
    async fn test_process_streams_results() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        write_model_package(&tmp.path().join("models/first.tar.gz"), "5")?;
        write_image(&tmp.path().join("images/a.jpg"), 3)?;
        write_image(&tmp.path().join("more/b.jpg"), 1)?;
        write_image(&tmp.path().join("more/c.png"), 3)?;
        let service = inference_service(tmp.path(), Some("models/first.tar.gz"));

        let events = collect(
            &service,
            ProcessRequest {
                run_set: Some(run_set()),
                model: None,
                properties: None,
            },
        )
        .await?;

        let results: Vec<_> = events
            .into_iter()
            .filter_map(|event| match event {
                Ok(ProcessEvent {
                    event: Some(Event::Results(results)),
                }) => Some(results),
                _ => None,
            })
            .collect();
        assert_eq!(results.len(), 1);
        let results = &results[0];
        assert_eq!(results.results.len(), 2);
        assert!(!results.cancelled);

        let first = &results.results[0];
        assert_eq!(
            first.original.as_ref().and_then(|o| o.label.as_ref()).map(|l| l.name.as_str()),
            Some("ship")
        );
        assert_eq!(first.found_labels[0].label.as_ref().map(|l| l.name.as_str()), Some("positive"));
        assert_eq!(first.regions.len(), 2);
        assert_eq!(first.regions[0].class_id, 5);
        let second = &results.results[1];
        assert_eq!(second.found_labels[0].label.as_ref().map(|l| l.name.as_str()), Some("negative"));

        Ok(())
    }

    #[tokio::test]
    async fn test_preflight_failure_reaches_the_stream() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        write_image(&tmp.path().join("images/a.jpg"), 3)?;
        let service = inference_service(tmp.path(), None);

        let events = collect(
            &service,
            ProcessRequest {
                run_set: Some(run_set()),
                model: None,
                properties: None,
            },
        )
        .await?;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            Ok(ProcessEvent { event: Some(Event::Message(message)) })
                if message.level == detector_proto::MessageLevel::Error as i32
        ));
        let status = events[1].as_ref().err().ok_or("expected a status")?;
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);

        Ok(())
    }

    #[tokio::test]
    async fn test_initialize_and_queries() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        write_model_package(&tmp.path().join("models/first.tar.gz"), "5")?;
        let service = inference_service(tmp.path(), None);

        let before = service.is_initialized(Request::new(Empty {})).await?.into_inner();
        let response = service
            .initialize(Request::new(InitializeRequest {
                model: Some(detector_proto::FilePath {
                    directory: "models".to_string(),
                    filename: "first.tar.gz".to_string(),
                }),
            }))
            .await?
            .into_inner();
        let after = service.is_initialized(Request::new(Empty {})).await?.into_inner();

        assert!(!before.initialized);
        assert!(response.initialized);
        assert!(after.initialized);

        let name = service.get_name(Request::new(Empty {})).await?.into_inner();
        assert_eq!(name.name, "Test_Detector");
        let properties = service
            .get_detector_properties(Request::new(Empty {}))
            .await?
            .into_inner();
        assert_eq!(properties.skip_frames, 150);
        assert!(properties.admitted_types.contains(&"JPG".to_string()));

        let cancel = service.cancel(Request::new(Empty {})).await?.into_inner();
        assert!(!cancel.cancelled);

        Ok(())
    }

    #[test]
    fn test_unset_verbosity_keeps_the_default() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let service = inference_service(tmp.path(), None);
        let properties = |verbosity: Option<i32>| DetectorProperties {
            verbosity,
            admitted_types: Vec::new(),
            skip_frames: 0,
        };
        let request = |properties| ProcessRequest {
            run_set: Some(run_set()),
            model: None,
            properties: Some(properties),
        };

        let (_, unset) = service.job_description(request(properties(None)));
        let (_, unknown) = service.job_description(request(properties(Some(42))));
        let (_, chosen) = service.job_description(request(properties(Some(
            detector_proto::MessageLevel::Debug as i32,
        ))));

        assert_eq!(unset, MessageLevel::Info);
        assert_eq!(unknown, MessageLevel::Info);
        assert_eq!(chosen, MessageLevel::Debug);

        Ok(())
    }

    #[tokio::test]
    async fn test_errors_reach_callers_without_verbosity() -> Result<(), Box<dyn std::error::Error>>
    {
        let tmp = tempfile::tempdir()?;
        write_image(&tmp.path().join("images/a.jpg"), 3)?;
        let service = inference_service(tmp.path(), None);

        let events = collect(
            &service,
            ProcessRequest {
                run_set: Some(run_set()),
                model: None,
                properties: Some(DetectorProperties {
                    verbosity: None,
                    admitted_types: Vec::new(),
                    skip_frames: 0,
                }),
            },
        )
        .await?;

        assert!(events.iter().any(|event| matches!(
            event,
            Ok(ProcessEvent { event: Some(Event::Message(message)) })
                if message.level == detector_proto::MessageLevel::Error as i32
        )));

        Ok(())
    }

    #[test]
    fn test_verbosity_filters_messages() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let callback = ChannelCallback {
            sender,
            verbosity: MessageLevel::Warn,
        };

        callback.message(MessageLevel::Info, "chatty");
        callback.message(MessageLevel::Error, "broken");

        let Ok(Ok(ProcessEvent {
            event: Some(Event::Message(message)),
        })) = receiver.try_recv()
        else {
            panic!("expected one message");
        };
        assert_eq!(message.text, "broken");
        assert!(receiver.try_recv().is_err());
    }
}
