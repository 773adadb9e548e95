//! Streaming nanoDQMIO extractor.
//!
//! The on-disk form is newline-delimited JSON: a header line naming
//! the format, schema version and run number, then one histogram per
//! line. Files can hold many components × lumi-sections, so the
//! extractor reads line-by-line instead of slurping the whole file.
//!
//! Extraction is deterministic: the same bytes always yield the same
//! record sequence. Any decode error after a valid header is a
//! whole-file `CorruptFile`; the index store's per-file atomicity
//! means no partial commits ever land.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use dqmflow_protocol::{HistogramPayload, HistogramRecord};
use serde::Deserialize;

use crate::error::{DqmError, Result};

/// Format identifier expected in the header line.
pub const FORMAT_MAGIC: &str = "nanodqmio";

/// Highest schema version this extractor understands.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Deserialize)]
struct Header {
    format: String,
    version: u32,
    run: u32,
}

#[derive(Debug, Deserialize)]
struct RecordLine {
    component: String,
    lumi: u32,
    bins: Vec<f64>,
    edges: Vec<f64>,
    entries: u64,
}

/// Header fields of a monitoring file, readable without extracting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub run_number: u32,
}

/// Read and validate only the header line.
///
/// Discovery uses this to learn the run number of a candidate file
/// without paying for full extraction.
pub fn read_header(path: &Path) -> Result<FileHeader> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(DqmError::CorruptFile {
            path: path.display().to_string(),
            reason: "empty file".to_string(),
        });
    }
    parse_header(path, &line)
}

fn parse_header(path: &Path, line: &str) -> Result<FileHeader> {
    let header: Header =
        serde_json::from_str(line.trim()).map_err(|e| DqmError::CorruptFile {
            path: path.display().to_string(),
            reason: format!("header: {e}"),
        })?;
    if header.format != FORMAT_MAGIC {
        return Err(DqmError::UnsupportedSchema {
            path: path.display().to_string(),
            reason: format!("format {:?}, expected {FORMAT_MAGIC:?}", header.format),
        });
    }
    if header.version > SCHEMA_VERSION {
        return Err(DqmError::UnsupportedSchema {
            path: path.display().to_string(),
            reason: format!("schema version {} > {SCHEMA_VERSION}", header.version),
        });
    }
    Ok(FileHeader {
        version: header.version,
        run_number: header.run,
    })
}

/// Extract all histogram records from one monitoring file.
///
/// `expected_run` is the run number recorded at discovery; a mismatch
/// means the file changed underneath us and is treated as corrupt.
pub fn extract(path: &Path, file_id: i64, expected_run: u32) -> Result<Vec<HistogramRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();

    let header_line = match lines.next() {
        Some(line) => line?,
        None => {
            return Err(DqmError::CorruptFile {
                path: path.display().to_string(),
                reason: "empty file".to_string(),
            });
        }
    };
    let header = parse_header(path, &header_line)?;
    if header.run_number != expected_run {
        return Err(DqmError::CorruptFile {
            path: path.display().to_string(),
            reason: format!(
                "header run {} does not match discovered run {expected_run}",
                header.run_number
            ),
        });
    }

    let extracted_at = chrono::Utc::now().to_rfc3339();
    let mut records = Vec::new();
    for (lineno, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: RecordLine =
            serde_json::from_str(line.trim()).map_err(|e| DqmError::CorruptFile {
                path: path.display().to_string(),
                reason: format!("line {}: {e}", lineno + 2),
            })?;
        if rec.edges.len() != rec.bins.len() + 1 {
            return Err(DqmError::CorruptFile {
                path: path.display().to_string(),
                reason: format!(
                    "line {}: {} edges for {} bins",
                    lineno + 2,
                    rec.edges.len(),
                    rec.bins.len()
                ),
            });
        }
        records.push(HistogramRecord {
            component: rec.component,
            run_number: header.run_number,
            lumi_section: rec.lumi,
            payload: HistogramPayload {
                bins: rec.bins,
                edges: rec.edges,
                entries: rec.entries,
            },
            extracted_at: extracted_at.clone(),
            source_file_id: file_id,
        });
    }

    tracing::debug!(
        path = %path.display(),
        records = records.len(),
        run = header.run_number,
        "extracted monitoring file"
    );
    Ok(records)
}
