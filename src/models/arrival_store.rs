use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::common::{Position3D, Timestamp};
use crate::models::node::{DetectionSample, Node};

/// ノードごとの最新キャプチャ記録
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalRecord {
    pub node_id: String,
    pub timestamp: Timestamp,
    pub position: Position3D,
    pub is_positive: bool,
    pub confidence: f64,
    pub source_reference: Option<String>,
}

impl ArrivalRecord {
    pub fn from_sample(sample: &DetectionSample, position: Position3D) -> Self {
        Self {
            node_id: sample.node_id.clone(),
            timestamp: sample.timestamp,
            position,
            is_positive: sample.is_positive,
            confidence: sample.confidence,
            source_reference: sample.source_reference.clone(),
        }
    }
}

/// 永続化形式（ノードIDをファイル名とする1ファイル1レコード）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedArrival {
    timestamp: Timestamp,
    source_reference: Option<String>,
    #[serde(default)]
    is_positive: bool,
    #[serde(default)]
    confidence: f64,
}

/// 到達記録ストア
///
/// アレイ内で唯一共有される可変状態です。書き込みはノードごとのキャプチャタスク
/// （ノードIDあたり1ライター）、読み出しは集約器のみが行います。
/// レコードはロック下で丸ごと置き換えられるため、読み出し側が書きかけの
/// レコードを観測することはありません。
#[derive(Debug, Clone, Default)]
pub struct ArrivalStore {
    records: Arc<RwLock<HashMap<String, ArrivalRecord>>>,
    persist_dir: Option<PathBuf>,
}

impl ArrivalStore {
    /// メモリ上のみのストアを作成
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// 指定ディレクトリに永続化するストアを作成
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(dir.clone(), e))?;
        Ok(Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            persist_dir: Some(dir),
        })
    }

    /// レコードを書き込む（同一ノードの既存レコードは上書き）
    ///
    /// メモリ上の置き換えはロック下で一度に行い、ファイルへの永続化は
    /// ロック解放後に非同期I/Oで行います。永続化に失敗した場合も
    /// メモリ上のレコードは更新済みです。
    pub async fn record(&self, record: ArrivalRecord) -> Result<(), StoreError> {
        debug!(node = %record.node_id, timestamp = record.timestamp, positive = record.is_positive, "到達記録を更新");
        let payload = self.persist_dir.as_ref().map(|dir| (dir.clone(), PersistedArrival::from(&record)));
        let node_id = record.node_id.clone();

        self.records.write().await.insert(node_id.clone(), record);

        match payload {
            Some((dir, payload)) => write_record(&dir, &node_id, &payload).await,
            None => Ok(()),
        }
    }

    /// ノードの最新レコード
    pub async fn get(&self, node_id: &str) -> Option<ArrivalRecord> {
        self.records.read().await.get(node_id).cloned()
    }

    /// 全ノードの最新レコードのスナップショット
    pub async fn snapshot(&self) -> Vec<ArrivalRecord> {
        let mut records: Vec<ArrivalRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// 永続化ディレクトリから設定済みノードのレコードを復元
    pub async fn restore(&self, nodes: &[Node]) -> Result<usize, StoreError> {
        let Some(dir) = &self.persist_dir else {
            return Ok(0);
        };

        let mut loaded = Vec::new();
        for node in nodes {
            let path = record_path(dir, &node.id);
            if !tokio::fs::try_exists(&path).await.map_err(|e| StoreError::Io(path.clone(), e))? {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| StoreError::Io(path.clone(), e))?;
            let persisted: PersistedArrival = match serde_json::from_str(&contents) {
                Ok(p) => p,
                Err(e) => {
                    warn!(node = %node.id, "到達記録を読み飛ばします: {}", e);
                    continue;
                }
            };
            loaded.push(ArrivalRecord {
                node_id: node.id.clone(),
                timestamp: persisted.timestamp,
                position: node.position,
                is_positive: persisted.is_positive,
                confidence: persisted.confidence,
                source_reference: persisted.source_reference,
            });
        }

        let restored = loaded.len();
        let mut records = self.records.write().await;
        for record in loaded {
            records.insert(record.node_id.clone(), record);
        }
        Ok(restored)
    }
}

fn record_path(dir: &Path, node_id: &str) -> PathBuf {
    dir.join(format!("{}.json", node_id))
}

impl From<&ArrivalRecord> for PersistedArrival {
    fn from(record: &ArrivalRecord) -> Self {
        Self {
            timestamp: record.timestamp,
            source_reference: record.source_reference.clone(),
            is_positive: record.is_positive,
            confidence: record.confidence,
        }
    }
}

/// 一時ファイルに書いてから rename で置き換える
///
/// ノードIDあたりライターは1つなので、一時ファイル名はノード単位で固定です。
async fn write_record(dir: &Path, node_id: &str, payload: &PersistedArrival) -> Result<(), StoreError> {
    let path = record_path(dir, node_id);
    let tmp = dir.join(format!(".{}.json.tmp", node_id));
    let json = serde_json::to_string(payload).map_err(|e| StoreError::Json(path.clone(), e))?;
    tokio::fs::write(&tmp, json).await.map_err(|e| StoreError::Io(tmp.clone(), e))?;
    tokio::fs::rename(&tmp, &path).await.map_err(|e| StoreError::Io(path.clone(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(node: &str, timestamp: f64, positive: bool) -> ArrivalRecord {
        ArrivalRecord {
            node_id: node.to_string(),
            timestamp,
            position: Position3D::new(1.0, 2.0, 3.0),
            is_positive: positive,
            confidence: 0.9,
            source_reference: Some(format!("buffer_{}.wav", timestamp)),
        }
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let store = ArrivalStore::in_memory();
        store.record(record("H1", 10.0, true)).await.unwrap();
        store.record(record("H1", 10.2, false)).await.unwrap();
        store.record(record("H2", 10.1, true)).await.unwrap();

        assert_eq!(store.len().await, 2);
        let h1 = store.get("H1").await.unwrap();
        assert_eq!(h1.timestamp, 10.2);
        assert!(!h1.is_positive);
    }

    #[tokio::test]
    async fn test_persist_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrivalStore::persistent(dir.path()).unwrap();
        store.record(record("H1", 42.5, true)).await.unwrap();
        store.record(record("H1", 43.5, true)).await.unwrap();

        let json = fs::read_to_string(dir.path().join("H1.json")).unwrap();
        assert!(json.contains("43.5"));
        assert!(json.contains("buffer_43.5.wav"));
        assert!(!dir.path().join(".H1.json.tmp").exists());

        let nodes = vec![
            Node::new("H1", Position3D::new(5.0, 6.0, 7.0), Duration::from_secs(1)),
            Node::new("H2", Position3D::new(0.0, 0.0, 0.0), Duration::from_secs(1)),
        ];
        let reloaded = ArrivalStore::persistent(dir.path()).unwrap();
        assert_eq!(reloaded.restore(&nodes).await.unwrap(), 1);
        let h1 = reloaded.get("H1").await.unwrap();
        assert_eq!(h1.timestamp, 43.5);
        assert_eq!(h1.position, Position3D::new(5.0, 6.0, 7.0));
        assert!(h1.is_positive);
    }

    #[tokio::test]
    async fn test_memory_is_updated_even_if_persistence_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrivalStore::persistent(dir.path()).unwrap();
        fs::remove_dir_all(dir.path()).unwrap();

        let result = store.record(record("H3", 7.0, true)).await;
        assert!(matches!(result, Err(StoreError::Io(_, _))));
        assert_eq!(store.get("H3").await.map(|r| r.timestamp), Some(7.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_persist_every_node() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArrivalStore::persistent(dir.path()).unwrap();

        let mut writers = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            writers.spawn(async move {
                let node = format!("H{}", i);
                store.record(record(&node, 100.0 + i as f64, true)).await
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(store.len().await, 16);
        let reloaded = ArrivalStore::persistent(dir.path()).unwrap();
        let nodes: Vec<Node> = (0..16)
            .map(|i| Node::new(format!("H{}", i), Position3D::zeros(), Duration::from_secs(1)))
            .collect();
        assert_eq!(reloaded.restore(&nodes).await.unwrap(), 16);
        assert_eq!(reloaded.get("H15").await.unwrap().timestamp, 115.0);
    }

    #[tokio::test]
    async fn test_restore_accepts_minimal_layout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("H9.json"), r#"{"timestamp": 1.5, "source_reference": "clip.wav"}"#).unwrap();
        let store = ArrivalStore::persistent(dir.path()).unwrap();
        let nodes = vec![Node::new("H9", Position3D::zeros(), Duration::from_secs(1))];
        assert_eq!(store.restore(&nodes).await.unwrap(), 1);
        let rec = store.get("H9").await.unwrap();
        assert!(!rec.is_positive);
        assert_eq!(rec.source_reference.as_deref(), Some("clip.wav"));
    }
}
