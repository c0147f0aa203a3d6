//! `reqwest`-backed implementation of [`UploadServer`].

use std::time::Duration;

use chunkup_protocol::{
    ChunkUploadRequest, ChunkUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
    ResumeInfoResponse,
};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;

use crate::config::ServerConfig;
use crate::server::{ServerError, ServerFuture, UploadServer};

/// HTTP client for the chunk, completion and resume-info endpoints.
pub struct HttpServer {
    http: reqwest::Client,
    chunk_url: String,
    complete_url: String,
    resume_url: String,
}

impl HttpServer {
    /// Builds a client for the endpoints described by `config`.
    pub fn new(config: &ServerConfig) -> Result<Self, ServerError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder.build()?;

        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            http,
            chunk_url: format!("{base}{}", config.chunk_path),
            complete_url: format!("{base}{}", config.complete_path),
            resume_url: format!("{base}{}", config.resume_path.trim_end_matches('/')),
        })
    }

    async fn post_chunk(
        &self,
        request: ChunkUploadRequest,
        data: Vec<u8>,
    ) -> Result<ChunkUploadResponse, ServerError> {
        let part = Part::bytes(data).file_name(request.file_name.clone());
        let mut form = Form::new()
            .part("chunk", part)
            .text("fileName", request.file_name)
            .text("chunkIndex", request.chunk_index.to_string())
            .text("totalChunks", request.total_chunks.to_string());
        if let Some(upload_id) = request.upload_id {
            form = form.text("uploadId", upload_id);
        }

        let resp = self.http.post(&self.chunk_url).multipart(form).send().await?;
        parse_json(resp).await
    }

    async fn post_complete(
        &self,
        request: CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, ServerError> {
        let resp = self
            .http
            .post(&self.complete_url)
            .json(&request)
            .send()
            .await?;
        parse_json(resp).await
    }

    async fn get_resume_info(&self, upload_id: String) -> Result<ResumeInfoResponse, ServerError> {
        let encoded = utf8_percent_encode(&upload_id, NON_ALPHANUMERIC).to_string();
        let url = format!("{}/{encoded}", self.resume_url);
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ServerError::UnknownUpload(upload_id));
        }
        parse_json(resp).await
    }
}

impl UploadServer for HttpServer {
    fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
        data: Vec<u8>,
    ) -> ServerFuture<'_, ChunkUploadResponse> {
        Box::pin(self.post_chunk(request, data))
    }

    fn complete(&self, request: CompleteUploadRequest) -> ServerFuture<'_, CompleteUploadResponse> {
        Box::pin(self.post_complete(request))
    }

    fn resume_info(&self, upload_id: String) -> ServerFuture<'_, ResumeInfoResponse> {
        Box::pin(self.get_resume_info(upload_id))
    }
}

async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ServerError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ServerError::Api {
            status: status.as_u16(),
            body,
        });
    }
    let body = resp.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}
