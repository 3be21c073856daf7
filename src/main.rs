use std::panic;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::janitor::Janitor;
use crate::core::publisher::Publisher;
use crate::core::scheduler::Scheduler;
use crate::core::service::JobService;
use crate::core::store::JobStore;
use crate::core::workspace::WorkspaceManager;
use crate::grpc::models::generation_service_server::GenerationServiceServer;
use crate::grpc::services::GenerationServiceImpl;
use crate::native::generator::NativeGenerator;

mod config;
mod constants;
mod core;
mod grpc;
mod native;
#[cfg(test)]
mod stubs;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }
    let config = Config::from_env()?;
    tracing::info!("Loaded configuration: {:?}", config);

    let workspaces = Arc::new(WorkspaceManager::init(config.roots.clone()).await?);
    let store = Arc::new(JobStore::new());
    let generator = Arc::new(NativeGenerator::new(
        &config.generator_path,
        config.generator_args.clone(),
        &config.artifact_extension,
        config.markers.clone(),
    ));
    let publisher = Arc::new(Publisher::new(
        store.clone(),
        workspaces.clone(),
        config.markers.clone(),
        config.extract_patches,
    ));
    let scheduler = Arc::new(Scheduler::start(
        config.scheduler.clone(),
        generator,
        store.clone(),
        workspaces.clone(),
        publisher,
    ));
    let service = Arc::new(JobService::new(
        config.upload.clone(),
        store.clone(),
        workspaces.clone(),
        scheduler.clone(),
    ));

    let janitor_shutdown = CancellationToken::new();
    let janitor = Janitor::new(config.janitor.clone(), store, workspaces);
    let janitor_handle = tokio::spawn({
        let shutdown = janitor_shutdown.clone();
        async move { janitor.run(shutdown).await }
    });

    let mut halt_rx = scheduler.subscribe_halt();
    let shutdown_signal = async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down"),
            _ = halt_rx.wait_for(Option::is_some) => {
                tracing::error!("Generator cannot be started, shutting down for operator intervention");
            }
        }
    };

    let grpc_service = GenerationServiceServer::new(GenerationServiceImpl::new(service));
    tracing::info!("gRPC server listening on {}", config.listen_addr);
    Server::builder()
        .add_service(grpc_service)
        .serve_with_shutdown(config.listen_addr, shutdown_signal)
        .await?;

    janitor_shutdown.cancel();
    let _ = janitor_handle.await;
    scheduler.shutdown(SHUTDOWN_GRACE).await;

    if let Some(err) = scheduler.halted() {
        tracing::error!(error = %err, "Exiting after fatal spawn failure");
        return Err(err.into());
    }
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
