//! Persisted synchronization watermark.
//!
//! A single timestamp, formatted `dd-MM-yy HH-mm-ss`, recording the
//! instant the previous successful pull *started*. The new value is
//! staged to a `.new` sibling at pull start and renamed over the
//! canonical file only once the whole pull succeeds, so a failed pull
//! leaves the old boundary in place and the next run retries the same
//! window.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::HarvestError;

pub const WATERMARK_FORMAT: &str = "%d-%m-%y %H-%M-%S";

#[derive(Debug, Clone)]
pub struct SyncWatermark {
    file: PathBuf,
    staged: PathBuf,
}

impl SyncWatermark {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let staged = PathBuf::from(format!("{}.new", file.display()));
        SyncWatermark { file, staged }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// The boundary for this pull. A missing file means the harvester
    /// has never completed a pull, so everything is newer than the
    /// boundary.
    pub fn read(&self) -> Result<DateTime<Utc>, HarvestError> {
        if !self.file.exists() {
            tracing::info!(
                "No watermark file at {:?}, considering every entity modified",
                self.file
            );
            return Ok(DateTime::<Utc>::UNIX_EPOCH);
        }
        let text = std::fs::read_to_string(&self.file)?;
        parse_watermark(text.trim())
    }

    /// Stage `at` as the candidate new watermark. Called at pull start
    /// so the committed value never post-dates any entity modification
    /// the pull might have missed.
    pub fn stage(&self, at: DateTime<Utc>) -> Result<(), HarvestError> {
        std::fs::write(&self.staged, format_watermark(at))?;
        Ok(())
    }

    /// Atomically promote the staged value. Only called after the pull
    /// has fully succeeded.
    pub fn commit(&self) -> Result<(), HarvestError> {
        if !self.staged.exists() {
            return Err(HarvestError::Watermark(format!(
                "No staged watermark at {:?} to commit",
                self.staged
            )));
        }
        std::fs::rename(&self.staged, &self.file)?;
        Ok(())
    }
}

pub fn format_watermark(at: DateTime<Utc>) -> String {
    at.format(WATERMARK_FORMAT).to_string()
}

pub fn parse_watermark(text: &str) -> Result<DateTime<Utc>, HarvestError> {
    let naive = NaiveDateTime::parse_from_str(text, WATERMARK_FORMAT)
        .map_err(|e| HarvestError::Watermark(format!("Cannot parse value as time '{text}': {e}")))?;
    Ok(naive.and_utc())
}
