//! # Resilient Image Fetching
//!
//! Retrieves one image payload over an unreliable link. Each attempt is a
//! self-contained unit that either yields a [`ValidatedPayload`] or a specific
//! [`AttemptFailure`]; a small retry driver runs attempts until one succeeds
//! or the attempt ceiling is hit.
//!
//! ## Attempt Pipeline
//! 1. Assemble the URL (geometry, `retries`, `attempts` query parameters)
//! 2. Send the request within the per-attempt timeout
//! 3. Require a 200 status and an accepted content type
//! 4. Work out the body framing; reject oversized declared lengths before
//!    allocating anything
//! 5. Stream the body through the matching decoder
//! 6. Require a baseline JPEG
//!
//! A payload only exists once all of the above have passed; partial or
//! unvalidated bytes never leave this module.

use crate::jpeg::{self, JpegKind};
use crate::stream::{read_body, BodyFraming, ReadTimeouts, StreamError};
use crate::target::{RequestTarget, TargetError};
use crate::transport::{Headers, HttpRequest, Transport, TransportError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Header names carrying optional render hints.
pub const HEADER_IMAGE_SOURCE: &str = "X-Image-Source";
pub const HEADER_NO_DITHERING: &str = "X-No-Dithering";
pub const HEADER_MESSAGE_PREFIX: &str = "X-Inky-Message-";
pub const MESSAGE_SLOTS: usize = 3;

/// Extra bytes allowed above the raw pixel budget.
pub const SIZE_SLACK: usize = 100;

/// Everything needed to address the image server.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    /// Endpoint root, e.g. `https://user:pw@frames.local`.
    pub root: String,
    /// Fixed base path, e.g. `/api/v1`.
    pub base_path: String,
    /// Chosen endpoint, e.g. `/render/apod`.
    pub endpoint: String,
    pub width: u32,
    pub height: u32,
    /// Height reserved for overlay messages, forwarded as `mbh`.
    pub message_box_height: u32,
    pub user_agent: String,
}

/// Limits applied to every attempt.
#[derive(Clone, Debug)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub read_timeouts: ReadTimeouts,
    /// Delay between failed attempts.
    pub backoff: Duration,
    pub accepted_types: Vec<String>,
    /// Hard ceiling on payload size in bytes.
    pub max_bytes: usize,
}

impl FetchPolicy {
    /// Ceiling derived from the panel: pixel area times bit depth plus slack.
    pub fn payload_ceiling(width: u32, height: u32, bit_depth: u32) -> usize {
        (width as usize)
            .saturating_mul(height as usize)
            .saturating_mul(bit_depth as usize)
            .saturating_add(SIZE_SLACK)
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            read_timeouts: ReadTimeouts::default(),
            backoff: Duration::from_secs(1),
            accepted_types: vec!["image/jpeg".to_string(), "image/jpg".to_string()],
            max_bytes: Self::payload_ceiling(1200, 825, 8),
        }
    }
}

/// Optional hints the server attaches to an image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderHints {
    pub image_source: Option<String>,
    pub no_dithering: bool,
    /// Overlay messages by position: top, middle, bottom.
    pub messages: [Option<String>; MESSAGE_SLOTS],
}

impl RenderHints {
    pub fn from_headers(headers: &Headers) -> Self {
        let messages = std::array::from_fn(|slot| {
            headers
                .get(&format!("{HEADER_MESSAGE_PREFIX}{slot}"))
                .map(str::to_string)
        });
        Self {
            image_source: headers.get(HEADER_IMAGE_SOURCE).map(str::to_string),
            no_dithering: headers
                .get(HEADER_NO_DITHERING)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            messages,
        }
    }
}

/// A payload that passed content-type, size and format checks.
#[derive(Debug)]
pub struct ValidatedPayload {
    bytes: Vec<u8>,
    hints: RenderHints,
    attempts: u32,
}

impl ValidatedPayload {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hints(&self) -> &RenderHints {
        &self.hints
    }

    /// Which attempt produced this payload (1-based).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn into_parts(self) -> (Vec<u8>, RenderHints) {
        (self.bytes, self.hints)
    }
}

/// Why a single attempt was abandoned. All of these are retried.
#[derive(Error, Debug)]
pub enum AttemptFailure {
    #[error("request failed: {0}")]
    Connect(#[from] TransportError),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("unexpected content type {0:?}")]
    ContentTypeMismatch(String),

    #[error("payload of {declared:?} bytes exceeds limit of {limit}")]
    SizeLimitExceeded { declared: Option<u64>, limit: usize },

    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("incomplete transfer: {0}")]
    IncompleteTransfer(String),

    #[error("payload is not a baseline JPEG ({0:?})")]
    FormatValidation(JpegKind),
}

impl From<StreamError> for AttemptFailure {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::TooLarge { limit } => Self::SizeLimitExceeded {
                declared: None,
                limit,
            },
            e @ (StreamError::Stalled { .. } | StreamError::Closed { .. }) => {
                Self::IncompleteTransfer(e.to_string())
            }
            e @ (StreamError::Io(_) | StreamError::MalformedChunkSize(_)) => {
                Self::StreamRead(e.to_string())
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    /// Missing or unusable request parameters; never retried.
    #[error("invalid request configuration: {0}")]
    InvalidRequestConfig(String),

    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted { attempts: u32, last: AttemptFailure },
}

impl From<TargetError> for FetchError {
    fn from(err: TargetError) -> Self {
        Self::InvalidRequestConfig(err.to_string())
    }
}

/// Fetch and validate one image, retrying per `policy`.
pub fn fetch<T: Transport>(
    transport: &mut T,
    spec: &RequestSpec,
    policy: &FetchPolicy,
) -> Result<ValidatedPayload, FetchError> {
    if spec.endpoint.trim().is_empty() {
        return Err(FetchError::InvalidRequestConfig("no endpoint given".into()));
    }
    if policy.max_attempts == 0 {
        return Err(FetchError::InvalidRequestConfig("max_attempts is zero".into()));
    }
    if spec.width == 0 || spec.height == 0 {
        return Err(FetchError::InvalidRequestConfig(format!(
            "display geometry {}x{} is empty",
            spec.width, spec.height
        )));
    }

    let mut target = RequestTarget::parse(&spec.root)?;
    target.extend_path(&[spec.base_path.as_str(), spec.endpoint.as_str()]);
    target.set_param("w", spec.width);
    target.set_param("h", spec.height);
    target.set_param("mbh", spec.message_box_height);
    target.set_param("retries", policy.max_attempts);

    let mut last = None;
    for attempt in 1..=policy.max_attempts {
        target.set_param("attempts", attempt);
        debug!(attempt, max = policy.max_attempts, url = %target.masked(), "fetching image");

        match run_attempt(transport, &target, spec, policy) {
            Ok((bytes, hints)) => {
                info!(attempt, bytes = bytes.len(), "image fetched");
                return Ok(ValidatedPayload {
                    bytes,
                    hints,
                    attempts: attempt,
                });
            }
            Err(failure) => {
                warn!(attempt, max = policy.max_attempts, error = %failure, "fetch attempt failed");
                last = Some(failure);
            }
        }

        if attempt < policy.max_attempts && !policy.backoff.is_zero() {
            thread::sleep(policy.backoff);
        }
    }

    let last = last.unwrap_or(AttemptFailure::HttpStatus(0));
    error!(attempts = policy.max_attempts, error = %last, "image fetch gave up");
    Err(FetchError::RetriesExhausted {
        attempts: policy.max_attempts,
        last,
    })
}

/// Framing of a response body from its headers and reported size.
///
/// The client-reported size wins; otherwise `Content-Length`; otherwise
/// chunked if declared, else read until close.
pub fn body_framing(headers: &Headers, reported_len: Option<u64>) -> Result<BodyFraming, Option<u64>> {
    let chunked = headers
        .get("Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));

    let declared = reported_len.filter(|n| *n > 0).or_else(|| {
        if chunked {
            return None;
        }
        headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    });

    match declared {
        Some(n) => usize::try_from(n).map(BodyFraming::Length).map_err(|_| Some(n)),
        None if chunked => Ok(BodyFraming::Chunked),
        None => Ok(BodyFraming::UntilClose),
    }
}

fn run_attempt<T: Transport>(
    transport: &mut T,
    target: &RequestTarget,
    spec: &RequestSpec,
    policy: &FetchPolicy,
) -> Result<(Vec<u8>, RenderHints), AttemptFailure> {
    let request = HttpRequest {
        url: target.url(),
        authorization: target.auth().map(|a| a.header_value()),
        user_agent: spec.user_agent.clone(),
        timeout: policy.attempt_timeout,
        poll_interval: policy.read_timeouts.poll_interval,
    };

    let mut response = transport.get(&request)?;
    if response.status != 200 {
        return Err(AttemptFailure::HttpStatus(response.status));
    }

    let hints = RenderHints::from_headers(&response.headers);
    if let Some(source) = &hints.image_source {
        info!(source = %source, "image source");
    }

    let content_type = response.headers.get("Content-Type").unwrap_or_default();
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    if !policy
        .accepted_types
        .iter()
        .any(|t| t.eq_ignore_ascii_case(media_type))
    {
        return Err(AttemptFailure::ContentTypeMismatch(content_type.to_string()));
    }

    let framing = body_framing(&response.headers, response.reported_len).map_err(|declared| {
        AttemptFailure::SizeLimitExceeded {
            declared,
            limit: policy.max_bytes,
        }
    })?;
    if let BodyFraming::Length(n) = framing {
        if n > policy.max_bytes {
            return Err(AttemptFailure::SizeLimitExceeded {
                declared: Some(n as u64),
                limit: policy.max_bytes,
            });
        }
    }
    debug!(?framing, "reading body");

    let bytes = read_body(response.body.as_mut(), framing, policy.max_bytes, policy.read_timeouts)?;
    if bytes.is_empty() {
        return Err(AttemptFailure::IncompleteTransfer("empty body".into()));
    }

    match jpeg::classify(&bytes) {
        JpegKind::Baseline => Ok((bytes, hints)),
        other => Err(AttemptFailure::FormatValidation(other)),
    }
}
