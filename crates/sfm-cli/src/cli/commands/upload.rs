//! `sfm upload` – resumable chunked upload of a file.

use anyhow::{Context, Result};
use sfm_core::upload::UploadEvent;
use sfm_core::{FetchService, ServiceConfig, UploadOptions, UploadRequest};
use std::path::PathBuf;

fn describe(event: &UploadEvent) -> String {
    match event {
        UploadEvent::LocationObtained(loc) => format!("upload {} at {}", loc.upload_id, loc.url),
        UploadEvent::ChunkStarted { offset, len } => format!("sending {len} bytes at {offset}"),
        UploadEvent::ChunkCompleted { confirmed } => format!("server has {confirmed} bytes"),
        UploadEvent::StatusQueried { offset } => format!("status query: server has {offset} bytes"),
        UploadEvent::RetryScheduled { failure, delay } => {
            format!("chunk failed ({failure}), retrying in {:.1}s", delay.as_secs_f64())
        }
    }
}

pub async fn run_upload(
    config: ServiceConfig,
    path: PathBuf,
    endpoint: &str,
    chunk_size: Option<u64>,
    content_type: Option<String>,
) -> Result<()> {
    let size = std::fs::metadata(&path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let mut request = UploadRequest::new(endpoint, path.clone())?;
    if let Some(t) = content_type {
        request = request.with_content_type(t);
    }

    let mut options = UploadOptions::new()
        .comment("sfm upload")
        .observer(|event| eprintln!("{}", describe(event)));
    if let Some(bytes) = chunk_size {
        options = options.chunk_size(bytes);
    }

    let service = FetchService::with_curl(config);
    let handle = service.begin_upload(request, options);
    let resp = handle.wait().await?;
    tracing::info!(path = %path.display(), size, status = resp.status, "upload finished");
    println!("{} uploaded {} bytes from {}", resp.status, size, path.display());
    if !resp.body.is_empty() {
        println!("{}", String::from_utf8_lossy(&resp.body));
    }
    Ok(())
}
