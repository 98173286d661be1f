//! Wire contract of the resumable upload protocol.
//!
//! Negotiation is a `POST` declaring the total length (or `*`), answered with
//! a `Location` for chunk submission. Chunks are `PUT`s carrying
//! `Content-Range: bytes a-b/total`. A status query is an empty `PUT` with
//! `Content-Range: bytes */total`; `308` + `Range: bytes=0-N` means the server
//! holds `N + 1` bytes, a 2xx means the upload is complete.

use url::Url;

use super::UploadLocation;
use crate::error::FetchError;
use crate::request::Headers;

pub const UPLOAD_CONTENT_TYPE: &str = "X-Upload-Content-Type";
pub const UPLOAD_CONTENT_LENGTH: &str = "X-Upload-Content-Length";
pub const UPLOAD_ID: &str = "X-Upload-Id";

/// "Resume incomplete": the server has part of the upload.
pub const RESUME_INCOMPLETE: u16 = 308;

/// Value of `X-Upload-Content-Length` for a known or streamed total.
pub fn declared_length(total: Option<u64>) -> String {
    match total {
        Some(n) => n.to_string(),
        None => "*".to_string(),
    }
}

/// `Content-Range` for `len > 0` bytes starting at `offset`. The end is inclusive.
pub fn chunk_range(offset: u64, len: u64, total: Option<u64>) -> String {
    let last = offset + len.max(1) - 1;
    format!("bytes {offset}-{last}/{}", declared_length(total))
}

/// `Content-Range` of the terminal empty chunk of a streamed upload.
pub fn finalize_range(total: u64) -> String {
    format!("bytes */{total}")
}

/// `Content-Range` of a status query.
pub fn query_range(total: Option<u64>) -> String {
    format!("bytes */{}", declared_length(total))
}

/// Bytes the server holds according to a 308 response. No `Range` means none.
pub fn parse_confirmed_offset(headers: &Headers) -> Result<u64, FetchError> {
    let Some(range) = headers.get("Range") else {
        return Ok(0);
    };
    let malformed = || FetchError::UploadProtocol(format!("malformed Range header {range:?}"));
    let value = range.trim();
    let value = value.strip_prefix("bytes=").unwrap_or(value);
    let (first, last) = value.split_once('-').ok_or_else(malformed)?;
    if first.trim() != "0" {
        return Err(malformed());
    }
    let last: u64 = last.trim().parse().map_err(|_| malformed())?;
    last.checked_add(1).ok_or_else(malformed)
}

/// Chunk location and upload id from a negotiation response.
pub(crate) fn location_from(endpoint: &Url, headers: &Headers) -> Result<UploadLocation, FetchError> {
    let location = headers.get("Location").ok_or_else(|| {
        FetchError::UploadProtocol("negotiation response carries no Location".into())
    })?;
    let url = endpoint.join(location.trim()).map_err(|e| {
        FetchError::UploadProtocol(format!("bad upload location {location:?}: {e}"))
    })?;
    let upload_id = headers
        .get(UPLOAD_ID)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| url.to_string());
    Ok(UploadLocation { upload_id, url })
}
