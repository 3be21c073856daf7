use std::sync::Arc;

use tokio::{
    fs::File,
    io::AsyncReadExt,
    sync::mpsc::{Sender, channel},
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::{
    constants::ARTIFACT_CHUNK_SIZE,
    core::{
        domain::{JobId, OwnerId},
        service::JobService,
    },
    grpc::{
        mappers::{parse_job_id, parse_owner},
        models::{
            ArtifactChunk, FetchArtifactRequest, JobRef, JobStatus, SubmitConfigRequest,
            SubmitConfigResponse, generation_service_server::GenerationService,
        },
    },
};

#[derive(Clone, Debug)]
pub struct GenerationServiceImpl {
    service: Arc<JobService>,
}

impl GenerationServiceImpl {
    pub fn new(service: Arc<JobService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl GenerationService for GenerationServiceImpl {
    type FetchArtifactStream = ReceiverStream<Result<ArtifactChunk, Status>>;

    #[tracing::instrument(skip_all)]
    async fn submit_config(
        &self,
        request: Request<SubmitConfigRequest>,
    ) -> Result<Response<SubmitConfigResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(
            owner = %req.owner_id,
            file_name = %req.file_name,
            size = req.content.len(),
            "Received config"
        );

        let owner = parse_owner(&req.owner_id)?;
        let job = self
            .service
            .submit(owner, &req.file_name, &req.content)
            .await?;

        Ok(Response::new(SubmitConfigResponse {
            job_id: job.id.to_string(),
        }))
    }

    #[tracing::instrument(skip_all)]
    async fn get_status(&self, request: Request<JobRef>) -> Result<Response<JobStatus>, Status> {
        let (owner, id): (OwnerId, JobId) = request.into_inner().try_into()?;
        let job = self.service.status(&owner, &id).await?;
        Ok(Response::new((&job).into()))
    }

    #[tracing::instrument(skip_all)]
    async fn fetch_artifact(
        &self,
        request: Request<FetchArtifactRequest>,
    ) -> Result<Response<Self::FetchArtifactStream>, Status> {
        let req = request.into_inner();
        let owner = parse_owner(&req.owner_id)?;
        let id = parse_job_id(&req.job_id)?;

        let (file_name, file) = self
            .service
            .open_artifact(&owner, &id, req.file_name.as_deref())
            .await?;
        tracing::info!(job_id = %id, file_name = %file_name, "Streaming artifact");

        let (stream_tx, stream_rx) = channel::<Result<ArtifactChunk, Status>>(16);
        tokio::spawn(stream_file(file_name, file, stream_tx));

        Ok(Response::new(ReceiverStream::new(stream_rx)))
    }

    #[tracing::instrument(skip_all)]
    async fn cancel_job(&self, request: Request<JobRef>) -> Result<Response<JobStatus>, Status> {
        let (owner, id): (OwnerId, JobId) = request.into_inner().try_into()?;
        let job = self.service.cancel(&owner, &id).await?;
        Ok(Response::new((&job).into()))
    }
}

/// Sends the file in fixed-size chunks. Stops early if the client hangs up.
async fn stream_file(
    file_name: String,
    mut file: File,
    stream_tx: Sender<Result<ArtifactChunk, Status>>,
) {
    let mut buf = vec![0u8; ARTIFACT_CHUNK_SIZE];
    loop {
        let chunk = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => Ok(ArtifactChunk {
                file_name: file_name.clone(),
                data: buf[..n].to_vec(),
            }),
            Err(e) => {
                tracing::error!(error = %e, file_name = %file_name, "Failed to read artifact");
                Err(Status::internal("failed to read artifact"))
            }
        };
        let failed = chunk.is_err();
        if stream_tx.send(chunk).await.is_err() {
            tracing::debug!(file_name = %file_name, "Client went away during download");
            break;
        }
        if failed {
            break;
        }
    }
}
