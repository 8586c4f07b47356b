//! Streamed payload decoding.
//!
//! The render protocol itself is opaque to the cache; a decoder turns a
//! byte stream into the wire structs and nothing more. The bundled decoder
//! buffers the stream and parses JSON, which is the immediate-decode shape
//! of the protocol.

use async_trait::async_trait;
use futures::StreamExt;

use crate::protocol::{STAGE_MARKER_COMPLETE, STAGE_MARKER_PARTIAL};
use crate::transport::{BodyStream, TransportError};
use crate::wire::{DynamicPayload, RoutePayload, SegmentPayload};

/// Error type for payload decoding.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload could not be parsed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The body stream failed mid-read.
    #[error(transparent)]
    Stream(#[from] TransportError),

    /// The body produced no bytes.
    #[error("empty body")]
    Empty,
}

/// Decodes streamed navigation payloads into wire structs.
#[async_trait]
pub trait PayloadDecoder: Send + Sync {
    /// Decode a route response, either format.
    async fn decode_route(&self, body: BodyStream) -> Result<RoutePayload, DecodeError>;

    /// Decode a per-segment response.
    async fn decode_segment(&self, body: BodyStream) -> Result<SegmentPayload, DecodeError>;

    /// Decode a dynamic multi-segment response.
    async fn decode_dynamic(&self, body: BodyStream) -> Result<DynamicPayload, DecodeError>;
}

/// The bundled serde_json-backed decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadDecoder;

impl JsonPayloadDecoder {
    async fn collect(body: BodyStream) -> Result<Vec<u8>, DecodeError> {
        let mut body = body;
        let mut bytes = Vec::new();
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(bytes)
    }

    fn parse<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl PayloadDecoder for JsonPayloadDecoder {
    async fn decode_route(&self, body: BodyStream) -> Result<RoutePayload, DecodeError> {
        Self::parse(&Self::collect(body).await?)
    }

    async fn decode_segment(&self, body: BodyStream) -> Result<SegmentPayload, DecodeError> {
        Self::parse(&Self::collect(body).await?)
    }

    async fn decode_dynamic(&self, body: BodyStream) -> Result<DynamicPayload, DecodeError> {
        Self::parse(&Self::collect(body).await?)
    }
}

/// Stage marker found at the head of a runtime-prefetch body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMarker {
    /// The content still contains dynamic holes.
    Partial,
    /// The content is complete.
    Complete,
}

/// Strip the leading one-byte stage marker from a runtime-prefetch body.
///
/// The marker bytes cannot collide with the first byte of any valid
/// payload row, so an unrecognized first byte means no marker. The
/// returned stream never yields the marker byte.
pub async fn strip_stage_marker(
    body: BodyStream,
) -> Result<(Option<StageMarker>, BodyStream), TransportError> {
    let mut body = body;
    let mut first = None;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if !chunk.is_empty() {
            first = Some(chunk);
            break;
        }
    }
    let Some(mut chunk) = first else {
        return Ok((None, Box::pin(futures::stream::empty())));
    };
    let marker = match chunk[0] {
        STAGE_MARKER_PARTIAL => Some(StageMarker::Partial),
        STAGE_MARKER_COMPLETE => Some(StageMarker::Complete),
        _ => None,
    };
    if marker.is_some() {
        chunk.remove(0);
    }
    let rest: BodyStream = if chunk.is_empty() {
        Box::pin(body)
    } else {
        Box::pin(futures::stream::iter([Ok(chunk)]).chain(body))
    };
    Ok((marker, rest))
}

/// Wrap a body stream, reporting the cumulative byte count after each
/// chunk. Used to attribute sizes while a response is still streaming.
pub fn count_bytes(
    body: BodyStream,
    mut on_bytes: impl FnMut(usize) + Send + 'static,
) -> BodyStream {
    let mut total = 0usize;
    Box::pin(body.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            total += chunk.len();
            on_bytes(total);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_of(chunks: Vec<Vec<u8>>) -> BodyStream {
        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    async fn collect(body: BodyStream) -> Vec<u8> {
        let mut body = body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_partial_marker_is_stripped() {
        let body = stream_of(vec![b"~{\"a\":1}".to_vec()]);
        let (marker, rest) = strip_stage_marker(body).await.unwrap();
        assert_eq!(marker, Some(StageMarker::Partial));
        assert_eq!(collect(rest).await, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_complete_marker_is_stripped() {
        let body = stream_of(vec![b"#".to_vec(), b"{}".to_vec()]);
        let (marker, rest) = strip_stage_marker(body).await.unwrap();
        assert_eq!(marker, Some(StageMarker::Complete));
        assert_eq!(collect(rest).await, b"{}");
    }

    #[tokio::test]
    async fn test_unmarked_body_passes_through() {
        let body = stream_of(vec![b"{\"a\":1}".to_vec()]);
        let (marker, rest) = strip_stage_marker(body).await.unwrap();
        assert_eq!(marker, None);
        assert_eq!(collect(rest).await, b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped_before_marker() {
        let body = stream_of(vec![Vec::new(), b"~x".to_vec()]);
        let (marker, rest) = strip_stage_marker(body).await.unwrap();
        assert_eq!(marker, Some(StageMarker::Partial));
        assert_eq!(collect(rest).await, b"x");
    }

    #[tokio::test]
    async fn test_count_bytes_reports_cumulative_totals() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let body = count_bytes(stream_of(vec![vec![0; 4], vec![0; 6]]), move |total| {
            sink.lock().unwrap().push(total);
        });
        collect(body).await;
        assert_eq!(*seen.lock().unwrap(), vec![4, 10]);
    }

    #[tokio::test]
    async fn test_json_decoder_rejects_empty_body() {
        let err = JsonPayloadDecoder
            .decode_segment(stream_of(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Empty));
    }
}
