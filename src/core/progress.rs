//! Progress values reported by long-running operations

use serde::{Deserialize, Serialize};

/// Per-file progress of an image build
///
/// `processed_files` and `processed_bytes` are cumulative for the whole build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProgress {
    pub total_files: usize,
    pub processed_files: usize,
    /// File name (not path) of the file just added
    pub current_file_name: String,
    pub total_bytes: u64,
    pub processed_bytes: u64,
}

impl BuildProgress {
    /// Percentage of bytes processed (0-100)
    pub fn percent_complete(&self) -> u32 {
        if self.total_bytes == 0 {
            if self.total_files == 0 {
                return 0;
            }
            return (self.processed_files * 100 / self.total_files) as u32;
        }
        (self.processed_bytes.saturating_mul(100) / self.total_bytes).min(100) as u32
    }
}

/// Progress of a burn as reported by the recorder subsystem
///
/// Values are passed through as received; the recorder decides the time unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurnProgress {
    pub elapsed_time_units: i64,
    pub estimated_total_time_units: i64,
}

impl BurnProgress {
    pub fn new(elapsed_time_units: i64, estimated_total_time_units: i64) -> Self {
        Self {
            elapsed_time_units,
            estimated_total_time_units,
        }
    }

    /// `elapsed * 100 / total`, or 0 when the total is not positive
    pub fn percent_complete(&self) -> i64 {
        if self.estimated_total_time_units > 0 {
            self.elapsed_time_units.saturating_mul(100) / self.estimated_total_time_units
        } else {
            0
        }
    }
}
