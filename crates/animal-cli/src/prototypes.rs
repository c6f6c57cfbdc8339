//! Build a prototype registry from a labelled dataset of cropped faces.
//!
//! The dataset CSV has an `image` column followed by one 0/1 column per
//! label. Every image marked for a label contributes its embedding to that
//! label's mean.

use animal_core::normalizer::{normalize_cropped, PixelNormalization};
use animal_core::oracle::Embed;
use animal_core::registry::{PrototypeRegistry, RegistryError};
use animal_core::Animal;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset is empty")]
    Empty,
    #[error("header column {column}: {source}")]
    Header {
        column: usize,
        source: animal_core::labels::UnknownLabel,
    },
    #[error("line {line}: {msg}")]
    Row { line: usize, msg: String },
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("{image}: embedding has {actual} dims, earlier images had {expected}")]
    DimensionMismatch {
        image: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    pub image: String,
    pub labels: Vec<Animal>,
}

/// Parse the dataset CSV. The first column names the image file.
pub fn parse_dataset(text: &str) -> Result<Vec<DatasetRow>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Err(DatasetError::Empty);
    }
    let columns: Vec<Animal> = headers
        .iter()
        .skip(1)
        .enumerate()
        .map(|(i, name)| {
            name.parse::<Animal>()
                .map_err(|source| DatasetError::Header { column: i + 2, source })
        })
        .collect::<Result<_, _>>()?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |p| p.line() as usize);
        if record.len() != columns.len() + 1 {
            return Err(DatasetError::Row {
                line,
                msg: format!("expected {} fields, found {}", columns.len() + 1, record.len()),
            });
        }
        let mut labels = Vec::new();
        for (flag, &label) in record.iter().skip(1).zip(&columns) {
            match flag {
                "1" => labels.push(label),
                "0" | "" => {}
                other => {
                    return Err(DatasetError::Row {
                        line,
                        msg: format!("{label}: expected 0 or 1, found {other:?}"),
                    })
                }
            }
        }
        rows.push(DatasetRow {
            image: record[0].to_string(),
            labels,
        });
    }
    Ok(rows)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub embedded: usize,
    pub skipped: usize,
}

/// Embed every dataset image and average per label.
pub fn build_prototypes<E: Embed>(
    embedder: &mut E,
    rows: &[DatasetRow],
    images_dir: &Path,
    input_size: u32,
    normalization: PixelNormalization,
) -> Result<(PrototypeRegistry, BuildStats), DatasetError> {
    let mut sums: HashMap<Animal, (Vec<f64>, usize)> = HashMap::new();
    let mut dim: Option<usize> = None;
    let mut stats = BuildStats::default();

    for (i, row) in rows.iter().enumerate() {
        let path = images_dir.join(&row.image);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image");
                stats.skipped += 1;
                continue;
            }
        };
        let embedding = match normalize_cropped(&bytes, input_size, normalization)
            .map_err(|e| e.to_string())
            .and_then(|face| embedder.embed(face).map_err(|e| e.to_string()))
        {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping image");
                stats.skipped += 1;
                continue;
            }
        };

        let expected = *dim.get_or_insert(embedding.dim());
        if embedding.dim() != expected {
            return Err(DatasetError::DimensionMismatch {
                image: row.image.clone(),
                expected,
                actual: embedding.dim(),
            });
        }

        for &label in &row.labels {
            let (sum, count) = sums
                .entry(label)
                .or_insert_with(|| (vec![0.0; expected], 0));
            for (s, v) in sum.iter_mut().zip(&embedding.values) {
                *s += f64::from(*v);
            }
            *count += 1;
        }
        stats.embedded += 1;

        if i % 50 == 0 {
            tracing::info!(done = i + 1, total = rows.len(), image = %row.image, "embedding dataset");
        }
    }

    let means: HashMap<Animal, Vec<f32>> = sums
        .into_iter()
        .map(|(label, (sum, count))| {
            let n = count as f64;
            (label, sum.iter().map(|s| (s / n) as f32).collect())
        })
        .collect();

    Ok((PrototypeRegistry::from_map(means)?, stats))
}
