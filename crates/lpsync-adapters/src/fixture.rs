//! JSON hand-off files written by the manual/OCR extraction step.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lpsync_core::LegacyRecord;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Extraction, ExtractionError, LegacySource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffBundle {
    #[serde(default)]
    pub captured_from: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub records: Vec<LegacyRecord>,
}

/// Accepts either a bundle object or a bare array of records.
#[derive(Deserialize)]
#[serde(untagged)]
enum HandoffFile {
    Bundle(HandoffBundle),
    Records(Vec<LegacyRecord>),
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, ExtractionError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ExtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&data).map_err(|source| ExtractionError::Json {
        path: path.to_path_buf(),
        source,
    })
}

pub async fn load_handoff_bundle(path: impl AsRef<Path>) -> Result<HandoffBundle, ExtractionError> {
    Ok(match read_json_file::<HandoffFile>(path.as_ref()).await? {
        HandoffFile::Bundle(bundle) => bundle,
        HandoffFile::Records(records) => HandoffBundle {
            captured_from: None,
            captured_at: None,
            records,
        },
    })
}

#[derive(Debug, Clone)]
pub struct JsonHandoffSource {
    path: PathBuf,
    id: String,
}

impl JsonHandoffSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = format!("json:{}", path.display());
        Self { path, id }
    }
}

#[async_trait]
impl LegacySource for JsonHandoffSource {
    fn source_id(&self) -> &str {
        &self.id
    }

    async fn extract(&self, run_id: Uuid) -> Result<Extraction, ExtractionError> {
        let bundle = load_handoff_bundle(&self.path).await?;
        let mut extraction = Extraction::default();
        for (index, record) in bundle.records.into_iter().enumerate() {
            if record.raw_title.trim().is_empty() {
                warn!(%run_id, index, "dropping hand-off record with blank title");
                extraction
                    .warnings
                    .push(format!("{}: record {index} has a blank title", self.path.display()));
                continue;
            }
            extraction.records.push(record);
        }
        info!(
            %run_id,
            source = %self.id,
            records = extraction.records.len(),
            captured_from = bundle.captured_from.as_deref().unwrap_or("-"),
            "hand-off loaded"
        );
        Ok(extraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpsync_core::SourceConfidence;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[tokio::test]
    async fn checked_in_handoff_loads_every_record() {
        let path = workspace_root().join("fixtures/legacy/records.json");
        let bundle = load_handoff_bundle(&path).await.unwrap();
        assert_eq!(bundle.records.len(), 4);
        assert_eq!(bundle.records[0].raw_title, "인문학 아카데미 3기");
        assert!(bundle
            .records
            .iter()
            .any(|r| r.source_confidence == SourceConfidence::Ocr));
    }

    #[tokio::test]
    async fn bare_arrays_and_blank_titles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff.json");
        std::fs::write(
            &path,
            r#"[
                {"rawTitle": "독서모임", "extractedDateText": "2024.03.02", "sourceConfidence": "text"},
                {"rawTitle": "   ", "extractedDateText": "", "sourceConfidence": "ocr"}
            ]"#,
        )
        .unwrap();

        let extraction = JsonHandoffSource::new(&path)
            .extract(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.warnings.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = JsonHandoffSource::new("/nonexistent/lpsync/handoff.json")
            .extract(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Io { .. }));
    }
}
