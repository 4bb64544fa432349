//! # Coordinator モジュール
//!
//! 協調状態機械を駆動する非同期コーディネーターを提供します。
//!
//! コーディネーターはアレイごとに1つ存在し、状態と到達記録ストアへの変更を
//! 直列化します（`&mut self` を通じた単一所有）。ノードごとのキャプチャは
//! 並列タスクとして実行され、結果は到達記録ストアに書き込まれます。
//!
//! ## 1ティックの処理
//!
//! 1. **PASSIVE**: 周期に達したノードを受動スキャンし、陽性があれば ARRAY_CAPTURE へ
//! 2. **ARRAY_CAPTURE**: 発信元以外の全ノードに同期キャプチャを指令し AGGREGATING へ
//! 3. **AGGREGATING**: キャプチャ完了または期限まで待ち、集約・判定して COOLDOWN へ
//! 4. **COOLDOWN**: 不感時間の経過後 PASSIVE へ

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::ArrayConfig;
use crate::error::SourceError;
use crate::models::aggregator::{AggregationOutcome, ArrivalAggregator};
use crate::models::arrival_store::{ArrivalRecord, ArrivalStore};
use crate::models::common::ArrayState;
use crate::models::node::{DetectionSample, Node};
use crate::models::scheduler::ScanScheduler;
use crate::models::solver::{Fix, LocalizationSolver, SolverConfig};
use crate::models::state_machine::{CoordinationStateMachine, LocalizationDecision};
use crate::models::track::TrackEstimator;
use crate::models::traits::{ContactReport, DetectionSource, FixReport, FixSink, PeerLink};

/// アレイ協調コーディネーター
pub struct Coordinator {
    nodes: Arc<Vec<Node>>,
    scheduler: ScanScheduler,
    store: ArrivalStore,
    aggregator: ArrivalAggregator,
    solver: LocalizationSolver,
    track: TrackEstimator,
    machine: CoordinationStateMachine,
    source: Arc<dyn DetectionSource>,
    sink: Arc<dyn FixSink>,
    capture_timeout: Duration,
    aggregation_timeout: Duration,
    tick_interval: Duration,
    /// 同期キャプチャ中のタスク
    pending: JoinSet<Option<DetectionSample>>,
    /// 今回の試行で指令に応答したノード
    commanded: HashSet<String>,
}

impl Coordinator {
    /// 設定からアレイのコーディネーターを組み立てる
    ///
    /// 到達記録ストアは呼び出し側が用意します（永続化の有無もここで決まる）。
    pub fn new(
        config: &ArrayConfig,
        source: Arc<dyn DetectionSource>,
        peers: Arc<dyn PeerLink>,
        sink: Arc<dyn FixSink>,
        store: ArrivalStore,
    ) -> Self {
        let solver = LocalizationSolver::new(SolverConfig {
            sound_speed: config.sound_speed,
            planar_fallback: config.planar_fallback,
            planar_depth: config.planar_depth,
            max_condition_number: config.max_condition_number,
        });

        Self {
            nodes: Arc::new(config.nodes()),
            scheduler: ScanScheduler::new(peers, config.peer_ack_timeout()),
            store,
            aggregator: ArrivalAggregator::new(config.correlation_window),
            solver,
            track: TrackEstimator::new(config.track_window, config.heading_mode),
            machine: CoordinationStateMachine::new(
                config.min_nodes_for_3d,
                config.min_nodes_for_contact,
                config.cooldown(),
            ),
            source,
            sink,
            capture_timeout: config.capture_timeout(),
            aggregation_timeout: config.aggregation_timeout(),
            tick_interval: config.tick_interval(),
            pending: JoinSet::new(),
            commanded: HashSet::new(),
        }
    }

    /// 現在の協調状態
    pub fn state(&self) -> ArrayState {
        self.machine.state()
    }

    pub fn machine(&self) -> &CoordinationStateMachine {
        &self.machine
    }

    /// 有効な Fix から作られた航跡
    pub fn track(&self) -> &TrackEstimator {
        &self.track
    }

    pub fn store(&self) -> &ArrivalStore {
        &self.store
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// 期限まで協調ループを実行
    pub async fn run_until(&mut self, deadline: Instant) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(nodes = self.nodes.len(), "協調ループ開始");
        while Instant::now() < deadline {
            interval.tick().await;
            self.tick().await;
            trace!(state = %self.state(), "tick");
        }
        self.pending.abort_all();
        info!(stats = ?self.machine.stats(), "協調ループ終了");
    }

    /// 現在の状態に応じて1ステップ進める
    pub async fn tick(&mut self) {
        match self.machine.state() {
            ArrayState::Passive => self.passive_scan().await,
            ArrayState::ArrayCapture => self.array_capture().await,
            ArrayState::Aggregating => self.aggregate().await,
            ArrayState::Cooldown => {
                self.machine.poll(Instant::now());
            }
        }
    }

    async fn passive_scan(&mut self) {
        let now = Instant::now();
        let due: Vec<Node> = self
            .scheduler
            .due_nodes(&self.nodes, now)
            .into_iter()
            .cloned()
            .collect();
        if due.is_empty() {
            return;
        }

        let mut scans = JoinSet::new();
        for node in due {
            self.scheduler.mark_scanned(&node.id, now);
            scans.spawn(capture_node(
                Arc::clone(&self.source),
                self.store.clone(),
                node,
                self.capture_timeout,
            ));
        }

        let mut samples = Vec::new();
        while let Some(joined) = scans.join_next().await {
            match joined {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => warn!("受動スキャンタスクが異常終了: {}", e),
            }
        }

        // 最も早い陽性検知をトリガーとする
        samples.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for sample in &samples {
            self.machine.on_passive_sample(sample);
        }
    }

    async fn array_capture(&mut self) {
        let Some(trigger) = self.machine.trigger().cloned() else {
            return;
        };

        self.commanded = self
            .scheduler
            .broadcast_synchronized_capture(&self.nodes, &trigger.node_id)
            .await;

        for node in self.nodes.iter().filter(|n| self.commanded.contains(&n.id)) {
            self.pending.spawn(capture_node(
                Arc::clone(&self.source),
                self.store.clone(),
                node.clone(),
                self.capture_timeout,
            ));
        }

        info!(
            trigger = %trigger.node_id,
            commanded = self.commanded.len(),
            unreachable = self.nodes.len().saturating_sub(1 + self.commanded.len()),
            "同期キャプチャ指令を送出"
        );

        let issued = self
            .machine
            .on_broadcast_issued(self.commanded.len(), Instant::now(), self.aggregation_timeout);
        if let Err(e) = issued {
            warn!("{}", e);
        }
    }

    async fn aggregate(&mut self) {
        let deadline = self.machine.aggregation_deadline().unwrap_or_else(Instant::now);

        let pending = &mut self.pending;
        let all_done = tokio::time::timeout_at(deadline, async move {
            while pending.join_next().await.is_some() {}
        })
        .await;

        if all_done.is_err() {
            warn!(outstanding = self.pending.len(), "集約期限切れ: 未完了のキャプチャを破棄");
            self.pending.abort_all();
            self.pending = JoinSet::new();
        }

        let Some(trigger) = self.machine.trigger().cloned() else {
            return;
        };
        let outcome = self.aggregator.collect(trigger.timestamp, self.store.snapshot().await);
        self.report_late(&outcome);

        let corroborating = outcome.corroborating(&trigger.node_id);
        let decision = match self.machine.on_aggregation_complete(
            outcome.positive_count,
            corroborating,
            Instant::now(),
        ) {
            Ok(decision) => decision,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };

        match decision {
            LocalizationDecision::Localize => {
                let fix = self.solver.solve(&outcome.observations, trigger.timestamp);
                self.publish_fix(&fix);
            }
            LocalizationDecision::Contact => {
                self.sink.on_contact(&ContactReport {
                    trigger_node: trigger.node_id.clone(),
                    positive_count: outcome.positive_count,
                    timestamp: trigger.timestamp,
                });
            }
            LocalizationDecision::NoContact => {
                info!(trigger = %trigger.node_id, "裏付けとなる検知なし");
            }
        }

        self.commanded.clear();
    }

    fn report_late(&self, outcome: &AggregationOutcome) {
        for stale in &outcome.stale {
            if self.commanded.contains(&stale.node_id) {
                warn!(
                    node = %stale.node_id,
                    offset = stale.offset,
                    kind = %stale.kind(),
                    "相関ウィンドウ外の到達（遅延）"
                );
            } else {
                debug!(node = %stale.node_id, offset = stale.offset, "古い到達記録を除外");
            }
        }
    }

    fn publish_fix(&mut self, fix: &Fix) {
        let accepted = self.track.accept(fix);
        let report = FixReport {
            position: fix.position,
            failure_kind: fix.failure_kind(),
            speed: if accepted { self.track.speed() } else { None },
            velocity: if accepted { self.track.velocity() } else { None },
            heading: if accepted { self.track.heading() } else { None },
            timestamp: fix.timestamp,
            residual_norm: fix.residual_norm,
            observations: fix.observations,
        };
        self.sink.on_fix(&report);
    }
}

/// 1ノードのキャプチャ＋分類を行い、結果を到達記録ストアへ書き込む
///
/// 検知ソースの失敗やタイムアウトは吸収され、None を返します。
async fn capture_node(
    source: Arc<dyn DetectionSource>,
    store: ArrivalStore,
    node: Node,
    timeout: Duration,
) -> Option<DetectionSample> {
    let sample = match tokio::time::timeout(timeout, source.capture_and_classify(&node.id)).await {
        Ok(Ok(sample)) => sample,
        Ok(Err(e)) => {
            warn!(node = %node.id, kind = %e.kind(), "検知ソース利用不可: {}", e);
            return None;
        }
        Err(_) => {
            let e = SourceError::Timeout;
            warn!(node = %node.id, kind = %e.kind(), "{}", e);
            return None;
        }
    };

    let sample = DetectionSample { node_id: node.id.clone(), ..sample };
    if let Err(e) = store.record(ArrivalRecord::from_sample(&sample, node.position)).await {
        warn!(node = %node.id, "到達記録の永続化に失敗: {}", e);
    }
    Some(sample)
}
