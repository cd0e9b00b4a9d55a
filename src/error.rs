use std::io;

use chrono::ParseError as ChronoParseError;
use quick_xml::Error as XmlError;
use regex::Error as RegexError;
use reqwest::Error as HttpError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::ParseError as UrlParseError;

/// Crate-wide error taxonomy.
///
/// The variants map onto the recovery policy of the engine: `Config`,
/// `Fetch` and `Parse` abort a pull before anything has been written,
/// `Lookup` and `Transfer` are recovered per entity, `Commit` and
/// `Deletion` abort the remainder of the pull after the point of no
/// return for this run (the watermark is never advanced on failure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Resource list fetch failed: {0}")]
    Fetch(String),
    #[error("Malformed resource list document: {0}")]
    Parse(String),
    #[error("Entity lookup failed: {0}")]
    Lookup(String),
    #[error("Transfer of data set '{code}' failed: {reason}")]
    Transfer { code: String, reason: String },
    #[error("Batch commit failed: {0}")]
    Commit(String),
    #[error("Deletion reconciliation failed: {0}")]
    Deletion(String),
    #[error("File system error: {0}")]
    Io(String),
    #[error("Watermark file error: {0}")]
    Watermark(String),
}

impl From<io::Error> for HarvestError {
    fn from(x: io::Error) -> Self {
        HarvestError::Io(format!("IOError: {x}"))
    }
}

impl From<HttpError> for HarvestError {
    fn from(x: HttpError) -> Self {
        HarvestError::Fetch(format!("{x}"))
    }
}

impl From<XmlError> for HarvestError {
    fn from(x: XmlError) -> Self {
        HarvestError::Parse(format!("XML error: {x}"))
    }
}

impl From<ChronoParseError> for HarvestError {
    fn from(x: ChronoParseError) -> Self {
        HarvestError::Parse(format!("Timestamp cannot be parsed: {x}"))
    }
}

impl From<UrlParseError> for HarvestError {
    fn from(x: UrlParseError) -> Self {
        HarvestError::Config(format!("Invalid URL: {x}"))
    }
}

impl From<RegexError> for HarvestError {
    fn from(x: RegexError) -> Self {
        HarvestError::Parse(format!("Pattern error: {x}"))
    }
}
