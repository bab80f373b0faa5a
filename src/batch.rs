use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::{ClassId, Token, DEFAULT_CLASS};

/// One document shard file: a batch-local vocabulary plus the documents
/// referring into it by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Stable identifier; derived from the filename stem when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Batch-local vocabulary keywords.
    pub tokens: Vec<String>,
    /// Class id per batch token; empty means the default class throughout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_ids: Vec<ClassId>,
    pub items: Vec<BatchItem>,
}

/// One document: parallel arrays of batch-local token ids and weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub token_ids: Vec<usize>,
    pub token_weights: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unable to parse batch {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed batch {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl Batch {
    /// The global token for a batch-local token index.
    pub fn token_at(&self, index: usize) -> Token {
        let class_id = self
            .class_ids
            .get(index)
            .map(String::as_str)
            .unwrap_or(DEFAULT_CLASS);
        Token::new(class_id, self.tokens[index].as_str())
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Total mass of the batch: the sum of every item's token weights.
    pub fn token_slot_count(&self) -> f64 {
        self.items
            .iter()
            .flat_map(|item| item.token_weights.iter())
            .map(|&weight| weight as f64)
            .sum()
    }

    fn validate(&self, path: &Path) -> Result<(), BatchError> {
        let malformed = |reason: String| BatchError::Malformed {
            path: path.to_path_buf(),
            reason,
        };

        if !self.class_ids.is_empty() && self.class_ids.len() != self.tokens.len() {
            return Err(malformed(format!(
                "{} class ids for {} tokens",
                self.class_ids.len(),
                self.tokens.len()
            )));
        }

        for (index, item) in self.items.iter().enumerate() {
            if item.token_ids.len() != item.token_weights.len() {
                return Err(malformed(format!(
                    "item {index} has {} token ids but {} weights",
                    item.token_ids.len(),
                    item.token_weights.len()
                )));
            }
            if let Some(&bad) = item.token_ids.iter().find(|&&id| id >= self.tokens.len()) {
                return Err(malformed(format!(
                    "item {index} refers to token {bad} outside the batch vocabulary of {}",
                    self.tokens.len()
                )));
            }
        }
        Ok(())
    }
}

/// Reads and validates one batch file. A batch without an id gets the
/// filename stem as its id.
pub fn load_batch(path: impl AsRef<Path>) -> Result<Batch, BatchError> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut batch: Batch =
        serde_json::from_reader(reader).map_err(|source| BatchError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    batch.validate(path)?;

    if batch.id.is_none() {
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| BatchError::Malformed {
                path: path.to_path_buf(),
                reason: "no id and no usable filename stem".to_string(),
            })?;
        batch.id = Some(stem.to_string());
    }
    Ok(batch)
}

/// Batch files of a directory in the one ordering every process agrees on:
/// lexicographic by file name. Shard indices point into this list.
pub fn list_batches(dir: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn write_batch(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_a_batch_and_keeps_its_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_batch(
            dir.path(),
            "b0.json",
            r#"{"id":"batch-7","tokens":["a","b"],"items":[{"token_ids":[0,1],"token_weights":[2.0,1.0]}]}"#,
        );

        let batch = load_batch(&path).unwrap();
        assert_eq!(batch.id.as_deref(), Some("batch-7"));
        assert_eq!(batch.token_at(0), Token::plain("a"));
        assert_eq!(batch.token_slot_count(), 3.0);
    }

    #[test]
    fn missing_id_falls_back_to_the_filename_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_batch(
            dir.path(),
            "shard-03.json",
            r#"{"tokens":["a"],"items":[{"token_ids":[0],"token_weights":[1.0]}]}"#,
        );

        let batch = load_batch(&path).unwrap();
        assert_eq!(batch.id.as_deref(), Some("shard-03"));
    }

    #[test]
    fn out_of_range_token_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_batch(
            dir.path(),
            "bad.json",
            r#"{"tokens":["a"],"items":[{"token_ids":[3],"token_weights":[1.0]}]}"#,
        );

        assert!(matches!(
            load_batch(&path),
            Err(BatchError::Malformed { .. })
        ));
    }

    #[test]
    fn garbage_fails_to_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_batch(dir.path(), "bad.json", "not json at all");
        assert!(matches!(load_batch(&path), Err(BatchError::Parse { .. })));
    }

    #[test]
    fn listing_is_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.json", "a.json", "b.json"] {
            write_batch(dir.path(), name, "{}");
        }

        let names: Vec<String> = list_batches(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json", "c.json"]);
    }
}
