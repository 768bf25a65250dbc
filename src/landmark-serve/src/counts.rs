//! Per-class training sample counts, derived from the training index CSV.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

pub const DEFAULT_COLUMN: &str = "landmark_id";

/// Number of training samples seen for each class index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelCounts {
    counts: HashMap<usize, u64>,
}

impl LabelCounts {
    /// Count the values of `column` in a headed CSV file.
    ///
    /// Files without that header fall back to their second column, which
    /// is where the class label sits in an `id,label` index. Such a file may
    /// also have no header row at all.
    pub fn from_path(path: &Path, column: &str) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path).map_err(|e| Error::model_load(path, e))?;

        let headers = rdr.headers().map_err(|e| Error::model_load(path, e))?;
        let mut counts = HashMap::new();

        let idx = match headers.iter().position(|h| h.trim() == column) {
            Some(idx) => idx,
            None if headers.len() >= 2 => {
                // a numeric second cell means the file has no header row
                match headers[1].trim().parse::<usize>() {
                    Ok(class) => {
                        debug!("{} has no header row", path.display());
                        counts.insert(class, 1);
                    }
                    Err(_) => warn!(
                        "{} has no '{}' column, counting column '{}' instead",
                        path.display(),
                        column,
                        &headers[1]
                    ),
                }
                1
            }
            None => {
                return Err(Error::model_load(
                    path,
                    format!("no '{}' column", column),
                ))
            }
        };

        for (n, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| Error::model_load(path, e))?;
            // first row (header or data) is line 1
            let line = n + 2;

            let cell = record.get(idx).unwrap_or("").trim();
            let class: usize = cell.parse().map_err(|_| {
                Error::model_load(
                    path,
                    format!("line {}: '{}' is not a class index", line, cell),
                )
            })?;

            *counts.entry(class).or_insert(0) += 1;
        }

        info!(
            "Loaded sample counts for {} classes from {}",
            counts.len(),
            path.display()
        );

        Ok(LabelCounts { counts })
    }

    pub fn get(&self, class: usize) -> Option<u64> {
        self.counts.get(&class).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl FromIterator<(usize, u64)> for LabelCounts {
    fn from_iter<I: IntoIterator<Item = (usize, u64)>>(iter: I) -> Self {
        LabelCounts {
            counts: iter.into_iter().collect(),
        }
    }
}

/// Sample count reported alongside a prediction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SampleCount {
    Count(u64),
    /// The table is loaded but has no entry for the class.
    Unknown,
    /// No table was loaded, or it has no rows.
    Unavailable,
}

impl SampleCount {
    pub fn lookup(table: Option<&LabelCounts>, class: usize) -> Self {
        match table {
            None => SampleCount::Unavailable,
            Some(table) if table.is_empty() => SampleCount::Unavailable,
            Some(table) => table
                .get(class)
                .map_or(SampleCount::Unknown, SampleCount::Count),
        }
    }
}

impl Serialize for SampleCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            SampleCount::Count(n) => serializer.serialize_u64(*n),
            SampleCount::Unknown => serializer.serialize_str("unknown"),
            SampleCount::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}
