//! `sfm get` – fetch a single URL.

use anyhow::{anyhow, Context, Result};
use sfm_core::{BackoffPolicy, FetchOptions, FetchService, Request, ServiceConfig};
use std::io::Write;
use std::path::Path;

/// Split a `Name: value` header argument.
pub(crate) fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("header {raw:?} is not in `Name: value` form"))?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(anyhow!("invalid header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub async fn run_get(
    config: ServiceConfig,
    url: &str,
    output: Option<&Path>,
    headers: &[String],
    retries: Option<u32>,
) -> Result<()> {
    let mut request = Request::get(url)?;
    for raw in headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    let mut options = FetchOptions::new().comment("sfm get");
    if let Some(max_retries) = retries {
        options = options.retry_policy(BackoffPolicy {
            max_retries,
            ..config.retry
        });
    }
    if let Some(path) = output {
        options = options.destination(path);
    }

    let service = FetchService::with_curl(config);
    let resp = service.fetch(request, options).wait().await?;
    tracing::info!(url, status = resp.status, attempts = resp.attempts, "get finished");

    match output {
        Some(path) => {
            let size = std::fs::metadata(path)
                .with_context(|| format!("stat {}", path.display()))?
                .len();
            eprintln!(
                "{} {} bytes -> {} ({} attempt(s))",
                resp.status,
                size,
                path.display(),
                resp.attempts
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&resp.body)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_split_and_trimmed() {
        let (name, value) = parse_header("Accept:  text/plain ").unwrap();
        assert_eq!(name, "Accept");
        assert_eq!(value, "text/plain");
    }

    #[test]
    fn header_value_may_contain_colons() {
        let (name, value) = parse_header("X-Time: 12:30:00").unwrap();
        assert_eq!(name, "X-Time");
        assert_eq!(value, "12:30:00");
    }

    #[test]
    fn header_without_colon_is_rejected() {
        assert!(parse_header("Accept text/plain").is_err());
        assert!(parse_header(": empty").is_err());
        assert!(parse_header("Bad Name: x").is_err());
    }
}
