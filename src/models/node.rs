use std::time::Duration;

use crate::models::common::{Position3D, Timestamp};

/// ハイドロフォンノード
///
/// 設定から一度だけ読み込まれ、以後は変更されません。
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// ノードの一意識別子
    pub id: String,
    /// ノードの3次元位置
    pub position: Position3D,
    /// 受動スキャンの最小間隔
    pub passive_interval: Duration,
}

impl Node {
    pub fn new(id: impl Into<String>, position: Position3D, passive_interval: Duration) -> Self {
        Self {
            id: id.into(),
            position,
            passive_interval,
        }
    }
}

/// 1回のキャプチャ＋分類の結果
///
/// 状態機械が即座に消費し、保持はしません。
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSample {
    pub node_id: String,
    /// シグネチャの到達時刻
    pub timestamp: Timestamp,
    pub is_positive: bool,
    /// 分類器の確信度 (0.0〜1.0)
    pub confidence: f64,
    /// 録音クリップへの参照（ファイル名など）
    pub source_reference: Option<String>,
}

impl DetectionSample {
    pub fn positive(node_id: impl Into<String>, timestamp: Timestamp, confidence: f64) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            is_positive: true,
            confidence,
            source_reference: None,
        }
    }

    pub fn negative(node_id: impl Into<String>, timestamp: Timestamp, confidence: f64) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp,
            is_positive: false,
            confidence,
            source_reference: None,
        }
    }

    pub fn with_source_reference(mut self, reference: impl Into<String>) -> Self {
        self.source_reference = Some(reference.into());
        self
    }
}
