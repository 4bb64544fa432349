use async_trait::async_trait;

use crate::error::{ErrorKind, PeerError, SourceError};
use crate::models::common::{Position3D, Timestamp};
use crate::models::node::DetectionSample;
use crate::models::track::Heading;

/// 検知ソース（録音 + 特徴抽出 + 分類器）のインターフェース
///
/// 実装はノードごとに1回のキャプチャを行い、分類結果を返します。
/// 失敗はアレイにとって致命的ではなく、「検知なし」として扱われます。
#[async_trait]
pub trait DetectionSource: Send + Sync {
    async fn capture_and_classify(&self, node_id: &str) -> Result<DetectionSample, SourceError>;
}

/// ピア起動チャネルのインターフェース
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// 指定ノードに即時キャプチャを指令し、応答（ack）を待つ
    async fn send_capture_command(&self, node_id: &str) -> Result<(), PeerError>;
}

/// 測位試行1回分の通知
#[derive(Debug, Clone, PartialEq)]
pub struct FixReport {
    pub position: Option<Position3D>,
    pub failure_kind: Option<ErrorKind>,
    pub speed: Option<f64>,
    /// 平均速度ベクトル[m/s]
    pub velocity: Option<Position3D>,
    pub heading: Option<Heading>,
    pub timestamp: Timestamp,
    pub residual_norm: Option<f64>,
    /// 解に使用した観測数
    pub observations: usize,
}

/// 測位に至らない低信頼度コンタクトの通知
#[derive(Debug, Clone, PartialEq)]
pub struct ContactReport {
    pub trigger_node: String,
    pub positive_count: usize,
    pub timestamp: Timestamp,
}

/// 測位結果の下流（警報・可視化）への出口
pub trait FixSink: Send + Sync {
    /// 成功・失敗を問わず、完了した測位試行ごとに呼ばれる
    fn on_fix(&self, report: &FixReport);

    /// 一部のノードのみが検知した場合に呼ばれる
    fn on_contact(&self, _contact: &ContactReport) {}
}
