use std::collections::HashMap;

use tracing::debug;

use crate::error::ErrorKind;
use crate::models::arrival_store::ArrivalRecord;
use crate::models::common::Timestamp;

/// 1回の測位試行のために集められた観測集合
///
/// 不変条件: ノードIDの重複なし、かつ max(timestamp) - min(timestamp) <= 相関ウィンドウ。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSet {
    records: Vec<ArrivalRecord>,
}

impl ObservationSet {
    /// 観測ノード数
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// ノードID順の観測レコード
    pub fn records(&self) -> &[ArrivalRecord] {
        &self.records
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.records.iter().any(|r| r.node_id == node_id)
    }

    /// タイムスタンプの広がり（最大 - 最小）
    pub fn span(&self) -> f64 {
        let min = self.records.iter().map(|r| r.timestamp).fold(f64::INFINITY, f64::min);
        let max = self.records.iter().map(|r| r.timestamp).fold(f64::NEG_INFINITY, f64::max);
        if self.records.is_empty() { 0.0 } else { max - min }
    }
}

impl From<Vec<ArrivalRecord>> for ObservationSet {
    /// ノードIDが重複する場合は最も新しいレコードを残す
    fn from(records: Vec<ArrivalRecord>) -> Self {
        Self { records: dedup_latest(records) }
    }
}

/// 相関ウィンドウから外れた記録
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRecord {
    pub node_id: String,
    pub timestamp: Timestamp,
    /// トリガー時刻からのずれ[s]
    pub offset: f64,
}

impl StaleRecord {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::StaleRecord
    }
}

/// 集約結果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationOutcome {
    pub observations: ObservationSet,
    /// 陽性検知として寄与したノード数
    pub positive_count: usize,
    /// ウィンドウ内で応答した（陰性を含む）ノード数
    pub responded: usize,
    pub stale: Vec<StaleRecord>,
}

impl AggregationOutcome {
    /// トリガーノード以外の陽性検知数
    pub fn corroborating(&self, trigger_node: &str) -> usize {
        self.positive_count - usize::from(self.observations.contains(trigger_node))
    }
}

/// 到達時刻集約器
///
/// トリガー時刻 `t0` と相関ウィンドウ `w` に対し、`[t0 - w, t0 + w]` に入る
/// 陽性の到達記録をノード単位で重複排除して観測集合を作ります。
#[derive(Debug, Clone)]
pub struct ArrivalAggregator {
    window: f64,
}

impl ArrivalAggregator {
    /// `window_s` は相関ウィンドウの片側幅[s]
    pub fn new(window_s: f64) -> Self {
        Self { window: window_s }
    }

    /// 相関ウィンドウ[s]
    pub fn window(&self) -> f64 {
        self.window
    }

    /// 到達記録を集約
    ///
    /// 空集合は正常な結果であり、閾値判定は状態機械が行います。
    pub fn collect(&self, t0: Timestamp, records: Vec<ArrivalRecord>) -> AggregationOutcome {
        let mut outcome = AggregationOutcome::default();
        let mut candidates = Vec::new();

        for record in dedup_latest(records) {
            let offset = record.timestamp - t0;
            if offset.abs() > self.window {
                debug!(node = %record.node_id, offset, "相関ウィンドウ外の到達記録を破棄");
                outcome.stale.push(StaleRecord {
                    node_id: record.node_id,
                    timestamp: record.timestamp,
                    offset,
                });
                continue;
            }

            outcome.responded += 1;
            if record.is_positive {
                candidates.push(record);
            }
        }

        let (kept, dropped) = self.fit_window(t0, candidates);
        for record in dropped {
            debug!(node = %record.node_id, "ウィンドウ幅を超えるため除外");
            outcome.stale.push(StaleRecord {
                node_id: record.node_id,
                offset: record.timestamp - t0,
                timestamp: record.timestamp,
            });
        }

        outcome.positive_count = kept.len();
        outcome.observations = ObservationSet { records: kept };
        outcome
    }

    /// 広がりが `window` 以下となる最大の部分集合を選ぶ
    ///
    /// 同数の場合は `t0` を含み、広がりが小さい方を優先します。
    fn fit_window(&self, t0: Timestamp, mut records: Vec<ArrivalRecord>) -> (Vec<ArrivalRecord>, Vec<ArrivalRecord>) {
        records.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        if records.is_empty() {
            return (records, Vec::new());
        }

        let mut best = (0usize, 0usize);
        let mut best_key = (0usize, false, f64::INFINITY);
        let mut end = 0;
        for start in 0..records.len() {
            if end < start {
                end = start;
            }
            while end + 1 < records.len()
                && records[end + 1].timestamp - records[start].timestamp <= self.window
            {
                end += 1;
            }
            let count = end - start + 1;
            let lo = records[start].timestamp;
            let hi = records[end].timestamp;
            let covers_t0 = lo <= t0 && t0 <= hi;
            let span = hi - lo;
            let better = count > best_key.0
                || (count == best_key.0 && covers_t0 && !best_key.1)
                || (count == best_key.0 && covers_t0 == best_key.1 && span < best_key.2);
            if better {
                best = (start, end);
                best_key = (count, covers_t0, span);
            }
        }

        let dropped_tail = records.split_off(best.1 + 1);
        let kept = records.split_off(best.0);
        let mut dropped = records;
        dropped.extend(dropped_tail);
        (kept, dropped)
    }
}

fn dedup_latest(records: Vec<ArrivalRecord>) -> Vec<ArrivalRecord> {
    let mut latest: HashMap<String, ArrivalRecord> = HashMap::new();
    for record in records {
        match latest.get(&record.node_id) {
            Some(existing) if existing.timestamp > record.timestamp => {}
            _ => {
                latest.insert(record.node_id.clone(), record);
            }
        }
    }
    let mut deduped: Vec<ArrivalRecord> = latest.into_values().collect();
    deduped.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    deduped
}
