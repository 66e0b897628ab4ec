//! Maps low-level extraction and network failures to stable user-facing text.
//!
//! Classification is total: anything that is not recognised ends up as
//! [`ErrorClass::Generic`]. Explicit status codes win over message fragments,
//! network indicators win over content-state indicators.

use std::error::Error as StdError;

use crate::error::UpstreamError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Gone,
    Forbidden,
    NotFound,
    Network,
    BotCheck,
    Unavailable,
    Private,
    AgeRestricted,
    InvalidUrl,
    Generic,
}

impl ErrorClass {
    pub fn message(self) -> &'static str {
        match self {
            Self::Gone => {
                "This video is no longer available. It may have been deleted, made private, or removed by the uploader."
            }
            Self::Forbidden => {
                "Access to this video is forbidden. It may be private, region-blocked, or require authentication."
            }
            Self::NotFound => "Video not found. Please check the URL and try again.",
            Self::Network => {
                "Network error: Unable to connect to YouTube. This could be due to network issues or YouTube being temporarily unavailable. Please try again later."
            }
            Self::BotCheck => "YouTube bot detection triggered. Please try again later.",
            Self::Unavailable => "This video is unavailable or private.",
            Self::Private => "This is a private video and cannot be processed.",
            Self::AgeRestricted => "This video is age restricted and cannot be processed.",
            Self::InvalidUrl => "Please provide a valid YouTube URL.",
            Self::Generic => "Failed to process the video. Please check the URL and try again.",
        }
    }
}

const NETWORK_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "ENOTFOUND",
    "ENETUNREACH",
    "network",
];

const NETWORK_FRAGMENTS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "fetch",
    "connection reset",
    "connection refused",
    "dns",
    "failed to resolve",
];

/// Classifies a raw message plus the optional structured fields an upstream
/// error may carry.
pub fn classify_parts(message: &str, status_code: Option<u16>, code: Option<&str>) -> ErrorClass {
    let lower = message.to_ascii_lowercase();

    if let Some(class) = status_code.and_then(class_for_status) {
        return class;
    }
    if let Some(class) = status_in_message(&lower).and_then(class_for_status) {
        return class;
    }

    if is_network_failure(&lower, code) {
        return ErrorClass::Network;
    }

    if lower.contains("sign in to confirm") {
        return ErrorClass::BotCheck;
    }
    if lower.contains("unavailable") {
        return ErrorClass::Unavailable;
    }
    if lower.contains("private video") {
        return ErrorClass::Private;
    }
    if lower.contains("age restricted") || lower.contains("age-restricted") {
        return ErrorClass::AgeRestricted;
    }
    if lower.contains("not a youtube url") {
        return ErrorClass::InvalidUrl;
    }

    ErrorClass::Generic
}

pub fn classify_upstream(err: &UpstreamError) -> ErrorClass {
    classify_parts(&err.message, err.status_code, err.code.as_deref())
}

/// Walks the source chain looking for an [`UpstreamError`]; any other error is
/// matched on its display text alone.
pub fn classify_error(err: &(dyn StdError + 'static)) -> ErrorClass {
    let mut current = Some(err);
    while let Some(candidate) = current {
        if let Some(upstream) = candidate.downcast_ref::<UpstreamError>() {
            return classify_upstream(upstream);
        }
        current = candidate.source();
    }
    classify_parts(&err.to_string(), None, None)
}

pub fn is_network_failure(lower_message: &str, code: Option<&str>) -> bool {
    if let Some(code) = code
        && NETWORK_CODES
            .iter()
            .any(|known| known.eq_ignore_ascii_case(code))
    {
        return true;
    }
    NETWORK_FRAGMENTS
        .iter()
        .any(|fragment| lower_message.contains(fragment))
}

fn class_for_status(status: u16) -> Option<ErrorClass> {
    match status {
        410 => Some(ErrorClass::Gone),
        403 => Some(ErrorClass::Forbidden),
        404 => Some(ErrorClass::NotFound),
        _ => None,
    }
}

/// Picks up `Status code: 410` (JS extractors) and `HTTP Error 410` (yt-dlp).
fn status_in_message(lower: &str) -> Option<u16> {
    ["status code: ", "http error "].iter().find_map(|marker| {
        let start = lower.find(marker)? + marker.len();
        let digits: String = lower[start..]
            .chars()
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        digits.parse().ok()
    })
}
