//! `sfm batch` – fetch many URLs through one service.

use anyhow::{bail, Context, Result};
use sfm_core::{FetchOptions, FetchService, Request, ServiceConfig};
use std::path::Path;

/// URLs from a list file: one per line, blank lines and `#` comments skipped.
pub(crate) fn parse_url_list(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect()
}

/// Parse every URL up front so a bad entry fails the batch before anything is sent.
pub(crate) fn build_requests(urls: &[&str]) -> Result<Vec<Request>> {
    urls.iter()
        .map(|url| Request::get(url).with_context(|| format!("bad URL in list: {url}")))
        .collect()
}

pub async fn run_batch(
    mut config: ServiceConfig,
    path: &Path,
    per_host: Option<usize>,
    global: Option<usize>,
) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read URL list {}", path.display()))?;
    let urls = parse_url_list(&text);
    if urls.is_empty() {
        println!("No URLs in {}.", path.display());
        return Ok(());
    }
    if let Some(n) = per_host {
        config.max_concurrent_per_host = n;
    }
    if let Some(n) = global {
        config.max_concurrent_global = n;
    }

    let requests = build_requests(&urls)?;
    let service = FetchService::with_curl(config);
    let handles: Vec<_> = requests
        .into_iter()
        .map(|request| service.fetch(request, FetchOptions::new().comment("sfm batch")))
        .collect();
    tracing::info!(count = handles.len(), "batch submitted");

    println!("{:<10} {:<8} {:<10} {}", "ID", "STATUS", "BYTES", "URL");
    let mut failed = 0usize;
    for (url, handle) in urls.iter().zip(handles) {
        let id = handle.id().to_string();
        match handle.wait().await {
            Ok(resp) => println!("{:<10} {:<8} {:<10} {}", id, resp.status, resp.body.len(), url),
            Err(e) => {
                failed += 1;
                println!("{:<10} {:<8} {:<10} {} ({})", id, "error", "-", url, e);
            }
        }
    }

    let stats = service.stats();
    tracing::debug!(sessions = stats.sessions, "batch finished");
    if failed > 0 {
        bail!("{failed} of {} fetches failed", urls.len());
    }
    Ok(())
}
