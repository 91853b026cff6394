use std::fmt;
use std::path::{Path, PathBuf};

use crate::users::{GeocodedUserRecord, ResolutionMethod};

/// Emitted after each batch has been persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch: usize,
    pub batch_count: usize,
    pub processed: usize,
    pub total: usize,
}

impl fmt::Display for BatchProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {}/{} complete: {}/{} records",
            self.batch, self.batch_count, self.processed, self.total
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub geocoded: usize,
    pub ai: usize,
    pub failed: usize,
    pub total: usize,
    pub output_path: PathBuf,
}

impl RunSummary {
    /// Counts `records` by resolution method.
    pub fn tally(records: &[GeocodedUserRecord], output_path: &Path) -> Self {
        let count = |method: ResolutionMethod| {
            records
                .iter()
                .filter(|record| record.method() == method)
                .count()
        };
        Self {
            geocoded: count(ResolutionMethod::Lookup),
            ai: count(ResolutionMethod::Fallback),
            failed: count(ResolutionMethod::Unresolved),
            total: records.len(),
            output_path: output_path.to_path_buf(),
        }
    }

    pub fn count(&self, method: ResolutionMethod) -> usize {
        match method {
            ResolutionMethod::Lookup => self.geocoded,
            ResolutionMethod::Fallback => self.ai,
            ResolutionMethod::Unresolved => self.failed,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Summary:")?;
        writeln!(f, "- Geocoded: {}", self.geocoded)?;
        writeln!(f, "- AI: {}", self.ai)?;
        writeln!(f, "- Failed: {}", self.failed)?;
        writeln!(f, "- Total: {}", self.total)?;
        write!(f, "\nResults saved to: {}", self.output_path.display())
    }
}
