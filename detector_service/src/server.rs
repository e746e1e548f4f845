use crate::{
    inference_service::InferenceService, model_service::ModelService, service::DetectorService,
};
use detector_proto::detector_server::DetectorServer;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

#[cfg(feature = "ort")]
use crate::{config::Config, ort_service::OrtModelService};

pub struct GrpcServer<M: ModelService> {
    service: Arc<DetectorService<M>>,
    addr: String,
}

impl<M: ModelService> GrpcServer<M> {
    pub fn new(service: Arc<DetectorService<M>>, addr: &str) -> Self {
        Self {
            service,
            addr: addr.to_string(),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.addr.parse()?;
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Detector service listening on {}", addr);

        self.serve(TcpListenerStream::new(listener), shutdown_signal())
            .await
    }

    /// Brings the detector up, serves until `shutdown` resolves, then tears
    /// it down. In-flight jobs are asked to stop before connections drain.
    pub async fn serve<F>(self, incoming: TcpListenerStream, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(detector_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let service = self.service;
        let starting = service.clone();
        tokio::task::spawn_blocking(move || starting.starting()).await?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<DetectorServer<InferenceService<M>>>()
            .await;

        let stopping = service.clone();
        let shutdown = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
            health_reporter
                .set_not_serving::<DetectorServer<InferenceService<M>>>()
                .await;
            stopping.stopping();
        };

        let served = Server::builder()
            .add_service(health_service)
            .add_service(reflection_service)
            .add_service(DetectorServer::new(InferenceService::new(service.clone())))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await;

        service.destroy();
        tracing::info!("Detector service stopped");

        Ok(served?)
    }
}

#[cfg(feature = "ort")]
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let model_service = OrtModelService::new(&config.model)?;
    let service = DetectorService::new(model_service, config.detector, config.runset);

    let addr = config.server.get_address();
    GrpcServer::new(Arc::new(service), &addr).run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
