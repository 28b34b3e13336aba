//! Layer store: one Parquet snapshot per medallion layer.
//!
//! Layout: `<root>/<layer>/<dataset>_<layer>.parquet`, with optional history
//! copies under `<root>/<layer>/history/`.
//!
//! Writes go to a temp file in the layer directory and are renamed into
//! place, so readers see either the previous snapshot or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::table::Table;

pub const DEFAULT_DATASET: &str = "covid";

/// Refinement level of a persisted table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Bronze, Layer::Silver, Layer::Gold];

    pub fn name(&self) -> &'static str {
        match self {
            Layer::Bronze => "bronze",
            Layer::Silver => "silver",
            Layer::Gold => "gold",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bronze" => Ok(Layer::Bronze),
            "silver" => Ok(Layer::Silver),
            "gold" => Ok(Layer::Gold),
            other => Err(format!("unknown layer '{other}' (expected bronze, silver or gold)")),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("layer {layer} not found at {path}")]
    LayerNotFound { layer: Layer, path: PathBuf },

    #[error("failed to write {layer} layer: {message}")]
    Write { layer: Layer, message: String },

    #[error("failed to read {layer} layer: {message}")]
    Read { layer: Layer, message: String },
}

/// Receipt for a completed layer write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerWrite {
    pub layer: Layer,
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    /// SHA-256 hex of the file contents.
    pub digest: String,
    /// History copy, when history is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

/// Filesystem-backed layer store.
#[derive(Debug, Clone)]
pub struct LayerStore {
    root: PathBuf,
    dataset: String,
    keep_history: bool,
}

impl LayerStore {
    /// Create a store rooted at `root`. Creates `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self::open(root))
    }

    /// Store handle for reading only. Touches nothing on disk.
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            dataset: DEFAULT_DATASET.to_string(),
            keep_history: false,
        }
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layer_dir(&self, layer: Layer) -> PathBuf {
        self.root.join(layer.name())
    }

    pub fn path(&self, layer: Layer) -> PathBuf {
        self.layer_dir(layer)
            .join(format!("{}_{}.parquet", self.dataset, layer))
    }

    pub fn exists(&self, layer: Layer) -> bool {
        self.path(layer).is_file()
    }

    /// Replace the snapshot for `layer` with `table`.
    pub fn write(&self, layer: Layer, table: &Table) -> Result<LayerWrite, StoreError> {
        let write_err = |message: String| StoreError::Write { layer, message };

        let encoded = encode_parquet(table).map_err(write_err)?;
        let digest = hex::encode(Sha256::digest(&encoded));

        let dir = self.layer_dir(layer);
        fs::create_dir_all(&dir).map_err(|e| write_err(format!("{}: {e}", dir.display())))?;

        // History goes first so a failed copy leaves the current snapshot as it was.
        let snapshot = if self.keep_history {
            Some(self.write_history(layer, &digest, &encoded)?)
        } else {
            None
        };

        let path = self.path(layer);
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| write_err(e.to_string()))?;
        tmp.write_all(&encoded).map_err(|e| write_err(e.to_string()))?;
        tmp.as_file().sync_all().map_err(|e| write_err(e.to_string()))?;
        tmp.persist(&path).map_err(|e| write_err(e.error.to_string()))?;

        info!(
            layer = %layer,
            path = %path.display(),
            rows = table.num_rows(),
            bytes = encoded.len(),
            digest = %digest,
            "Layer written"
        );

        Ok(LayerWrite {
            layer,
            path,
            rows: table.num_rows(),
            bytes: encoded.len() as u64,
            digest,
            snapshot,
        })
    }

    fn write_history(&self, layer: Layer, digest: &str, encoded: &[u8]) -> Result<PathBuf, StoreError> {
        let write_err = |message: String| StoreError::Write { layer, message };
        let dir = self.layer_dir(layer).join("history");
        fs::create_dir_all(&dir).map_err(|e| write_err(format!("{}: {e}", dir.display())))?;

        let snapshot_id = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            &digest[..12]
        );
        let path = dir.join(format!("{snapshot_id}.parquet"));
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| write_err(e.to_string()))?;
        tmp.write_all(encoded).map_err(|e| write_err(e.to_string()))?;
        tmp.persist(&path).map_err(|e| write_err(e.error.to_string()))?;
        debug!(layer = %layer, snapshot = %path.display(), "Layer snapshot kept");
        Ok(path)
    }

    /// History snapshots for `layer`, oldest first.
    pub fn history(&self, layer: Layer) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.layer_dir(layer).join("history");
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::Read {
            layer,
            message: format!("{}: {e}", dir.display()),
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Load the current snapshot for `layer`.
    pub fn read(&self, layer: Layer) -> Result<Table, StoreError> {
        let path = self.path(layer);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::LayerNotFound {
                    layer,
                    path: path.clone(),
                }
            } else {
                StoreError::Read {
                    layer,
                    message: format!("{}: {e}", path.display()),
                }
            }
        })?;
        let read_err = |message: String| StoreError::Read { layer, message };

        let builder =
            ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| read_err(e.to_string()))?;
        let schema = builder.schema().clone();
        let reader = builder.build().map_err(|e| read_err(e.to_string()))?;
        let batches = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| read_err(e.to_string()))?;

        let table = Table::from_record_batches(&schema, &batches)
            .map_err(|e| read_err(e.to_string()))?;
        debug!(layer = %layer, rows = table.num_rows(), "Layer read");
        Ok(table)
    }

    /// [`write`](Self::write) on the blocking pool.
    pub async fn write_async(
        &self,
        layer: Layer,
        table: Arc<Table>,
    ) -> Result<LayerWrite, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.write(layer, &table))
            .await
            .map_err(|e| StoreError::Write {
                layer,
                message: format!("writer task failed: {e}"),
            })?
    }

    /// [`read`](Self::read) on the blocking pool.
    pub async fn read_async(&self, layer: Layer) -> Result<Table, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read(layer))
            .await
            .map_err(|e| StoreError::Read {
                layer,
                message: format!("reader task failed: {e}"),
            })?
    }
}

/// Encode `table` as a single-row-group Parquet file. Writer properties are
/// fixed so equal tables encode to equal bytes.
fn encode_parquet(table: &Table) -> Result<Vec<u8>, String> {
    let batch = table.to_record_batch().map_err(|e| e.to_string())?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_created_by("medallion".to_string())
        .build();

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), Some(props)).map_err(|e| e.to_string())?;
    writer.write(&batch).map_err(|e| e.to_string())?;
    writer.close().map_err(|e| e.to_string())?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, CONFIRMED, ENTITY, FATALITY_RATE, TIMESTAMP};
    use chrono::NaiveDate;

    fn make_store() -> (tempfile::TempDir, LayerStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LayerStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn sample() -> Table {
        Table::new(vec![
            Column::utf8(ENTITY, vec![Some("A".into()), Some("B".into()), None]),
            Column::date(
                TIMESTAMP,
                vec![NaiveDate::from_ymd_opt(2020, 2, 1), None, NaiveDate::from_ymd_opt(2020, 2, 3)],
            ),
            Column::int64(CONFIRMED, vec![Some(3), None, Some(9)]),
            Column::float64(FATALITY_RATE, vec![Some(0.125), Some(0.0), None]),
        ])
        .unwrap()
    }

    #[test]
    fn test_layer_parse_and_display() {
        assert_eq!("Silver".parse::<Layer>().unwrap(), Layer::Silver);
        assert_eq!(Layer::Gold.to_string(), "gold");
        assert!("platinum".parse::<Layer>().is_err());
    }

    #[test]
    fn test_path_layout() {
        let (dir, store) = make_store();
        assert_eq!(
            store.path(Layer::Bronze),
            dir.path().join("bronze").join("covid_bronze.parquet")
        );
        let renamed = store.clone().with_dataset("flu");
        assert_eq!(
            renamed.path(Layer::Gold),
            dir.path().join("gold").join("flu_gold.parquet")
        );
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (_dir, store) = make_store();
        let table = sample();
        let receipt = store.write(Layer::Silver, &table).unwrap();
        assert_eq!(receipt.rows, 3);
        assert_eq!(receipt.digest.len(), 64);
        assert!(store.exists(Layer::Silver));

        let back = store.read(Layer::Silver).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_identical_tables_give_identical_bytes() {
        let (_dir, store) = make_store();
        let first = store.write(Layer::Gold, &sample()).unwrap();
        let bytes_a = fs::read(&first.path).unwrap();
        let second = store.write(Layer::Gold, &sample()).unwrap();
        let bytes_b = fs::read(&second.path).unwrap();
        assert_eq!(first.digest, second.digest);
        assert_eq!(bytes_a, bytes_b);
    }

    #[test]
    fn test_failed_history_copy_keeps_current_snapshot() {
        let (_dir, store) = make_store();
        store.write(Layer::Bronze, &sample()).unwrap();
        // A plain file where the history directory belongs.
        fs::write(store.layer_dir(Layer::Bronze).join("history"), b"").unwrap();

        let smaller = sample().take(&[0]).unwrap();
        let err = store
            .clone()
            .with_history(true)
            .write(Layer::Bronze, &smaller)
            .unwrap_err();
        assert!(matches!(err, StoreError::Write { layer: Layer::Bronze, .. }));
        assert_eq!(store.read(Layer::Bronze).unwrap().num_rows(), 3);
    }

    #[test]
    fn test_open_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("absent");
        let store = LayerStore::open(&root);
        assert!(!store.exists(Layer::Gold));
        assert!(matches!(
            store.read(Layer::Gold),
            Err(StoreError::LayerNotFound { layer: Layer::Gold, .. })
        ));
        assert!(!root.exists());
    }

    #[test]
    fn test_write_replaces_previous_snapshot() {
        let (_dir, store) = make_store();
        store.write(Layer::Bronze, &sample()).unwrap();
        let smaller = sample().take(&[0]).unwrap();
        store.write(Layer::Bronze, &smaller).unwrap();
        assert_eq!(store.read(Layer::Bronze).unwrap().num_rows(), 1);
    }

    #[test]
    fn test_empty_table_roundtrip() {
        let (_dir, store) = make_store();
        let empty = sample().take(&[]).unwrap();
        store.write(Layer::Gold, &empty).unwrap();
        let back = store.read(Layer::Gold).unwrap();
        assert_eq!(back.num_rows(), 0);
        assert_eq!(back.column_names(), empty.column_names());
    }

    #[test]
    fn test_read_missing_layer() {
        let (_dir, store) = make_store();
        match store.read(Layer::Gold) {
            Err(StoreError::LayerNotFound { layer, .. }) => assert_eq!(layer, Layer::Gold),
            other => panic!("expected LayerNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_read_corrupt_layer() {
        let (_dir, store) = make_store();
        fs::create_dir_all(store.layer_dir(Layer::Silver)).unwrap();
        fs::write(store.path(Layer::Silver), b"not parquet").unwrap();
        assert!(matches!(
            store.read(Layer::Silver),
            Err(StoreError::Read { .. })
        ));
    }

    #[test]
    fn test_history_kept_when_enabled() {
        let (_dir, store) = make_store();
        let store = store.with_history(true);
        let receipt = store.write(Layer::Gold, &sample()).unwrap();
        let snapshot = receipt.snapshot.unwrap();
        assert!(snapshot.is_file());
        assert_eq!(store.history(Layer::Gold).unwrap(), vec![snapshot]);
        assert!(store.history(Layer::Bronze).unwrap().is_empty());
    }

    #[test]
    fn test_no_history_by_default() {
        let (_dir, store) = make_store();
        let receipt = store.write(Layer::Gold, &sample()).unwrap();
        assert!(receipt.snapshot.is_none());
        assert!(!store.layer_dir(Layer::Gold).join("history").exists());
    }

    #[tokio::test]
    async fn test_async_roundtrip() {
        let (_dir, store) = make_store();
        let table = Arc::new(sample());
        store.write_async(Layer::Bronze, table.clone()).await.unwrap();
        let back = store.read_async(Layer::Bronze).await.unwrap();
        assert_eq!(&back, table.as_ref());
    }
}
