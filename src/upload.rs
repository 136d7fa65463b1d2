//! Helpers shared by uploaders: collecting staged records and writing
//! them in fixed-size batches.

use serde_json::Value;
use std::future::Future;

use crate::error::{IngestError, Result};
use crate::models::UploadContent;
use crate::stage::read_elements;

/// Read every staged file and concatenate their records in order.
pub fn read_staged_records(contents: &[UploadContent]) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    for content in contents {
        records.extend(read_elements(&content.path)?);
    }
    Ok(records)
}

/// Call `write` once per chunk of at most `batch_size` records.
///
/// The first failing batch stops the loop and is reported as
/// [`IngestError::Write`]; batches before it are left in place.
/// Returns the number of batches written.
pub async fn write_batches<T, F, Fut>(records: Vec<T>, batch_size: usize, mut write: F) -> Result<usize>
where
    F: FnMut(usize, Vec<T>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let batch_size = batch_size.max(1);
    let total = records.len();
    let mut written = 0;
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        let batch: Vec<T> = iter.by_ref().take(batch_size).collect();
        let len = batch.len();
        if let Err(err) = write(written, batch).await {
            tracing::error!(batch = written, size = len, error = %err, "batch write failed");
            return Err(match err {
                IngestError::Write(msg) => IngestError::Write(msg),
                other => IngestError::Write(format!("batch {}: {}", written, other)),
            });
        }
        written += 1;
    }
    tracing::debug!(records = total, batches = written, "batches written");
    Ok(written)
}
