// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! JSONL result file to CSV.
//!
//! Each record becomes one row holding the record's values in the order they appear; keys are
//! dropped and no header is written. Records are not checked against each other, so rows can
//! have different widths.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read failed at line {line}: {source}")]
    Read {
        line: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: expected a JSON object")]
    NotAnObject { line: usize },

    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("flushing CSV output failed: {0}")]
    Flush(#[source] std::io::Error),

    #[error("{0} already has a .csv extension, refusing to overwrite it")]
    SamePath(PathBuf),
}

/// `results/run.jsonl` -> `results/run.csv`
pub fn csv_path_for(input: &Path) -> PathBuf {
    input.with_extension("csv")
}

/// Convert `input` into a CSV file next to it. Returns the output path and the number of rows.
pub fn convert_file(input: &Path) -> Result<(PathBuf, usize), ConvertError> {
    let output = csv_path_for(input);
    if output == input {
        return Err(ConvertError::SamePath(input.to_path_buf()));
    }

    let reader = File::open(input).map_err(|source| ConvertError::Io {
        path: input.to_path_buf(),
        source,
    })?;
    let writer = File::create(&output).map_err(|source| ConvertError::Io {
        path: output.clone(),
        source,
    })?;

    let rows = jsonl_to_csv(BufReader::new(reader), BufWriter::new(writer))?;
    tracing::info!(input = %input.display(), output = %output.display(), rows, "Converted results");
    Ok((output, rows))
}

/// Stream records from `reader` to CSV rows on `writer`. Blank lines are skipped.
pub fn jsonl_to_csv<R: BufRead, W: Write>(reader: R, writer: W) -> Result<usize, ConvertError> {
    let mut csv = csv::WriterBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_writer(writer);

    let mut rows = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.map_err(|source| ConvertError::Read {
            line: line_no,
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Value = serde_json::from_str(&line).map_err(|source| ConvertError::Json {
            line: line_no,
            source,
        })?;
        let Value::Object(fields) = record else {
            return Err(ConvertError::NotAnObject { line: line_no });
        };

        csv.write_record(fields.values().map(cell))?;
        rows += 1;
    }

    csv.flush().map_err(ConvertError::Flush)?;
    Ok(rows)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
    }
}
