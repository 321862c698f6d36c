use std::sync::Arc;

use chrono::Utc;
use shared::{
    domain::Attachment,
    protocol::{CompleteUploadRequest, CompleteUploadResponse},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::Result,
    gateway::{ApiRequest, MultipartField, RequestGateway},
};

pub const DEFAULT_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: u8,
}

impl UploadProgress {
    fn new(loaded: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((loaded as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            loaded,
            total,
            percentage,
        }
    }
}

/// Chunked file upload. Chunks go up in order; the first failure aborts the
/// upload and already-sent chunks are left for the service to expire.
pub struct Uploader {
    gateway: Arc<RequestGateway>,
    chunk_bytes: usize,
}

impl Uploader {
    pub fn new(gateway: Arc<RequestGateway>, chunk_bytes: usize) -> Self {
        Self {
            gateway,
            chunk_bytes: chunk_bytes.max(1),
        }
    }

    pub async fn upload(
        &self,
        file_name: &str,
        mime_type: &str,
        bytes: &[u8],
        progress: Option<&(dyn Fn(UploadProgress) + Send + Sync)>,
    ) -> Result<Attachment> {
        let file_id = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().simple().to_string()[..9]
        );
        let total = bytes.len() as u64;
        let total_chunks = bytes.len().div_ceil(self.chunk_bytes);
        info!(file_id = %file_id, total_chunks, size = total, "upload: starting chunked upload");

        let mut loaded = 0u64;
        for (chunk_index, chunk) in bytes.chunks(self.chunk_bytes).enumerate() {
            let fields = vec![
                MultipartField::File {
                    name: "chunk".into(),
                    file_name: file_name.to_string(),
                    mime_type: None,
                    data: chunk.to_vec(),
                },
                text_field("fileId", &file_id),
                text_field("chunkIndex", &chunk_index.to_string()),
                text_field("totalChunks", &total_chunks.to_string()),
                text_field("fileName", file_name),
                text_field("mimeType", mime_type),
            ];
            let request = ApiRequest::post("/assets/upload-chunk").multipart(fields);
            if let Err(err) = self.gateway.send(&request).await {
                warn!(file_id = %file_id, chunk_index, "upload: chunk failed, aborting: {err}");
                return Err(err);
            }

            loaded += chunk.len() as u64;
            debug!(file_id = %file_id, chunk_index, loaded, "upload: chunk stored");
            if let Some(report) = progress {
                report(UploadProgress::new(loaded, total));
            }
        }

        let request = ApiRequest::post("/assets/complete-upload").json(&CompleteUploadRequest {
            file_id: file_id.clone(),
            file_name: file_name.to_string(),
        })?;
        let completed: CompleteUploadResponse = self.gateway.send_json(&request).await?;
        info!(file_id = %file_id, "upload: completed");

        Ok(Attachment {
            url: completed.url,
            mime_type: mime_type.to_string(),
            filename: file_name.to_string(),
            size: total,
        })
    }
}

fn text_field(name: &str, value: &str) -> MultipartField {
    MultipartField::Text {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
