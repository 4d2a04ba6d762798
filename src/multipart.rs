//! Source selection for `multipart/form-data` senders.
//!
//! The pipe engine always streams from a single byte source. Most senders
//! provide that source directly as the request body, but a browser `<form>`
//! upload arrives as a multipart envelope instead. This module narrows that
//! envelope down to exactly the first part — the rest of the multipart body
//! is never looked at, matching the spec's "first part only" source rule.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use thiserror::Error;

use crate::registry::SourceHeaders;

/// Failure while locating or reading the first multipart part.
#[derive(Debug, Error)]
pub(crate) enum MultipartError {
    /// The `Content-Type` header did not carry a usable `boundary=` parameter.
    #[error("invalid multipart boundary: {0}")]
    Boundary(#[source] multer::Error),

    /// The multipart body had no parts at all.
    #[error("multipart body had no parts")]
    Empty,

    /// Reading the chosen part failed partway through.
    #[error("failed to read multipart part: {0}")]
    Part(#[source] multer::Error),
}

/// The single byte stream the pipe engine actually forwards to receivers.
///
/// A raw sender is forwarded frame-for-frame; a multipart sender is narrowed
/// to its first part by [`Source::multipart`].
pub(crate) enum Source {
    Raw(Incoming),
    Multipart(multer::Field<'static>),
}

impl Source {
    /// Wraps a raw (non-multipart) request body.
    pub(crate) fn raw(body: Incoming) -> Self {
        Source::Raw(body)
    }

    /// Parses `body` as `multipart/form-data` using the boundary declared in
    /// `content_type`, and resolves to the stream of just its first part.
    ///
    /// Headers carried by the chosen part (its own `Content-Type` and
    /// `Content-Disposition`, if present) take priority over whatever the
    /// outer request declared, since they describe the actual payload.
    pub(crate) async fn multipart(
        body: Incoming,
        content_type: &HeaderValue,
    ) -> Result<(Self, SourceHeaders), MultipartError> {
        let content_type = content_type.to_str().unwrap_or_default();
        let boundary = multer::parse_boundary(content_type).map_err(MultipartError::Boundary)?;

        let stream = BodyExt::into_data_stream(body);
        let mut multipart = multer::Multipart::new(stream, boundary);

        let field = multipart
            .next_field()
            .await
            .map_err(MultipartError::Part)?
            .ok_or(MultipartError::Empty)?;

        let headers = headers_from_field(field.headers());
        Ok((Source::Multipart(field), headers))
    }

    /// Reads the next chunk of the source, or `None` at a clean end-of-stream.
    pub(crate) async fn next_chunk(&mut self) -> Option<Result<Bytes, SourceReadError>> {
        match self {
            Source::Raw(body) => loop {
                match body.frame().await {
                    None => return None,
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            return Some(Ok(data));
                        }
                        // Trailers: not data, keep reading.
                    }
                    Some(Err(err)) => return Some(Err(SourceReadError::Hyper(err))),
                }
            },
            Source::Multipart(field) => match field.chunk().await {
                Ok(Some(bytes)) => Some(Ok(bytes)),
                Ok(None) => None,
                Err(err) => Some(Err(SourceReadError::Multipart(err))),
            },
        }
    }
}

/// A failure reading the next chunk from the source, mid-transfer.
#[derive(Debug, Error)]
pub(crate) enum SourceReadError {
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    #[error(transparent)]
    Multipart(#[from] multer::Error),
}

impl SourceReadError {
    /// Whether this failure looks like the sender's connection going away,
    /// as opposed to a genuine protocol-level read error.
    ///
    /// `hyper::Error::is_closed` is the only signal hyper exposes for this;
    /// a multipart parse error is always treated as a source error since
    /// `multer` does not distinguish the two.
    pub(crate) fn is_disconnect(&self) -> bool {
        matches!(self, SourceReadError::Hyper(err) if err.is_closed())
    }
}

fn headers_from_field(headers: &HeaderMap) -> SourceHeaders {
    SourceHeaders {
        content_length: headers.get(http::header::CONTENT_LENGTH).cloned(),
        content_type: headers.get(http::header::CONTENT_TYPE).cloned(),
        content_disposition: headers.get(http::header::CONTENT_DISPOSITION).cloned(),
    }
}
