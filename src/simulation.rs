//! # Simulation モジュール
//!
//! 実機のハイドロフォンの代わりに、移動する音源と理想的な水中音響伝搬を
//! 模擬する環境を提供し、コーディネーターを実時間で駆動します。
//!
//! ## 音響モデル
//!
//! - 音源は `source_start + source_velocity * t` を等速直線運動し、
//!   `ping_interval` ごとにシグネチャを発します
//! - ノード `p` への到達時刻は `t_emit + |s(t_emit) - p| / c`
//! - 探知距離内で、キャプチャ時点から `capture_length` 以内に到達したシグネチャが
//!   あれば陽性、なければ陰性
//! - `faulty` のノードは録音に失敗し、`unreachable` のノードは起動指令に応答しません
//!
//! ## 使用例
//!
//! ```no_run
//! use hydroarray::config::ArrayConfig;
//! use hydroarray::simulation::SimulationEngine;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ArrayConfig::from_file("configs/array_sim.yaml")?;
//! let mut engine = SimulationEngine::new(config, 1)?;
//! let summary = engine.run(None).await?;
//! println!("測位 {} 件", summary.fixes);
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ArrayConfig, SimulationSettings};
use crate::error::{ConfigError, PeerError, SourceError};
use crate::models::{
    ArrayEvent, ArrivalStore, ChannelSink, Coordinator, DetectionSample, DetectionSource, FixSink,
    LogSink, PeerLink, Position3D, Timestamp,
};

/// 模擬音響環境
#[derive(Debug, Clone)]
pub struct AcousticScenario {
    settings: SimulationSettings,
    sound_speed: f64,
    positions: HashMap<String, Position3D>,
    epoch: Instant,
}

impl AcousticScenario {
    pub fn new(config: &ArrayConfig, settings: SimulationSettings, epoch: Instant) -> Self {
        let positions = config
            .nodes()
            .into_iter()
            .map(|node| (node.id, node.position))
            .collect();
        Self {
            settings,
            sound_speed: config.sound_speed,
            positions,
            epoch,
        }
    }

    /// シミュレーション開始からの経過時間[s]
    pub fn now(&self) -> Timestamp {
        Instant::now().saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// 時刻 t における音源位置
    pub fn source_position(&self, t: Timestamp) -> Position3D {
        let start = Position3D::from(self.settings.source_start);
        let velocity = Position3D::from(self.settings.source_velocity);
        start + velocity * t
    }

    /// `now` 以前 `capture_length` 以内に `receiver` へ到達した最新のシグネチャ
    ///
    /// (到達時刻, 伝搬距離) を返します。
    pub fn latest_arrival(&self, receiver: &Position3D, now: Timestamp) -> Option<(Timestamp, f64)> {
        let interval = self.settings.ping_interval;
        let earliest = now - self.settings.capture_length;
        let max_travel = self.settings.detection_range / self.sound_speed;
        let last_ping = (now.min(self.settings.t_max) / interval).floor() as i64;

        let mut best: Option<(Timestamp, f64)> = None;
        let mut k = last_ping;
        while k >= 0 {
            let t_emit = k as f64 * interval;
            if t_emit + max_travel < earliest {
                break;
            }
            let distance = (self.source_position(t_emit) - receiver).norm();
            let arrival = t_emit + distance / self.sound_speed;
            if distance <= self.settings.detection_range
                && arrival >= earliest
                && arrival <= now
                && best.is_none_or(|(t, _)| arrival > t)
            {
                best = Some((arrival, distance));
            }
            k -= 1;
        }
        best
    }

    fn capture(&self, node_id: &str) -> Result<DetectionSample, SourceError> {
        if self.settings.faulty.iter().any(|id| id == node_id) {
            return Err(SourceError::Io(format!("{}: ハイドロフォン録音デバイス応答なし", node_id)));
        }
        let receiver = self.positions.get(node_id).ok_or(SourceError::ClassifierUnavailable)?;
        let now = self.now();

        let sample = match self.latest_arrival(receiver, now) {
            Some((arrival, distance)) => {
                let confidence = (1.0 - distance / self.settings.detection_range).clamp(0.5, 0.99);
                DetectionSample::positive(node_id, arrival, confidence)
            }
            None => DetectionSample::negative(node_id, now, 0.05),
        };
        Ok(sample.with_source_reference(format!("buffer_{}_{:.3}.wav", node_id, now)))
    }
}

/// 模擬環境に基づく検知ソース
pub struct SimulatedDetectionSource {
    scenario: Arc<AcousticScenario>,
}

impl SimulatedDetectionSource {
    pub fn new(scenario: Arc<AcousticScenario>) -> Self {
        Self { scenario }
    }
}

#[async_trait]
impl DetectionSource for SimulatedDetectionSource {
    async fn capture_and_classify(&self, node_id: &str) -> Result<DetectionSample, SourceError> {
        let sample = self.scenario.capture(node_id)?;
        log_sample(&sample);
        Ok(sample)
    }
}

fn log_sample(sample: &DetectionSample) {
    debug!(
        node = %sample.node_id,
        positive = sample.is_positive,
        t = sample.timestamp,
        confidence = sample.confidence,
        "キャプチャ＋分類"
    );
}

/// 模擬ピア通信
pub struct SimulatedPeerLink {
    unreachable: HashSet<String>,
    ack_latency: Duration,
}

impl SimulatedPeerLink {
    pub fn new(settings: &SimulationSettings) -> Self {
        Self {
            unreachable: settings.unreachable.iter().cloned().collect(),
            ack_latency: Duration::from_secs_f64(settings.ack_latency.max(0.0)),
        }
    }
}

#[async_trait]
impl PeerLink for SimulatedPeerLink {
    async fn send_capture_command(&self, node_id: &str) -> Result<(), PeerError> {
        tokio::time::sleep(self.ack_latency).await;
        if self.unreachable.contains(node_id) {
            return Err(PeerError::Unreachable(node_id.to_string()));
        }
        Ok(())
    }
}

/// シミュレーション結果の概要
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSummary {
    pub fixes: usize,
    pub failed_fixes: usize,
    pub contacts: usize,
    /// 有効な測位の真値との平均誤差[m]
    pub mean_error: Option<f64>,
}

/// シミュレーションエンジン
pub struct SimulationEngine {
    config: ArrayConfig,
    settings: SimulationSettings,
    verbose_level: u8,
}

impl SimulationEngine {
    pub fn new(config: ArrayConfig, verbose_level: u8) -> Result<Self, ConfigError> {
        let settings = config.simulation.clone().ok_or_else(|| {
            ConfigError::Validation("simulation section is required to run the simulator".to_string())
        })?;
        Ok(Self { config, settings, verbose_level })
    }

    /// シミュレーションを実行（`duration` は t_max を上書き）
    pub async fn run(&mut self, duration: Option<f64>) -> Result<SimulationSummary, Box<dyn std::error::Error>> {
        let t_max = duration.unwrap_or(self.settings.t_max);
        let epoch = Instant::now();
        let scenario = Arc::new(AcousticScenario::new(&self.config, self.settings.clone(), epoch));

        let store = match &self.config.arrival_store_dir {
            Some(dir) => {
                let store = ArrivalStore::persistent(dir)?;
                let restored = store.restore(&self.config.nodes()).await?;
                info!(restored, dir = %dir.display(), "到達記録を復元");
                store
            }
            None => ArrivalStore::in_memory(),
        };

        let (sink, mut events) = ChannelSink::new();
        let collector_scenario = Arc::clone(&scenario);
        let collector = tokio::spawn(async move {
            let log = LogSink;
            let mut summary = SimulationSummary::default();
            let mut total_error = 0.0;
            while let Some(event) = events.recv().await {
                match event {
                    ArrayEvent::Fix(report) => {
                        log.on_fix(&report);
                        match report.position {
                            Some(position) => {
                                let truth = collector_scenario.source_position(report.timestamp);
                                let error = (position - truth).norm();
                                info!(error, "真値との誤差 {:.2} m", error);
                                total_error += error;
                                summary.fixes += 1;
                            }
                            None => summary.failed_fixes += 1,
                        }
                    }
                    ArrayEvent::Contact(contact) => {
                        log.on_contact(&contact);
                        summary.contacts += 1;
                    }
                }
            }
            if summary.fixes > 0 {
                summary.mean_error = Some(total_error / summary.fixes as f64);
            }
            summary
        });

        let mut coordinator = Coordinator::new(
            &self.config,
            Arc::new(SimulatedDetectionSource::new(Arc::clone(&scenario))),
            Arc::new(SimulatedPeerLink::new(&self.settings)),
            Arc::new(sink),
            store,
        );

        info!("=== シミュレーション実行開始 ===");
        if self.verbose_level > 0 {
            info!(
                nodes = coordinator.nodes().len(),
                t_max,
                ping_interval = self.settings.ping_interval,
                "シミュレーション設定"
            );
        }

        coordinator.run_until(epoch + Duration::from_secs_f64(t_max)).await;
        let stats = coordinator.machine().stats().clone();
        drop(coordinator);

        let summary = match collector.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!("結果集計タスクが異常終了: {}", e);
                SimulationSummary::default()
            }
        };

        info!("=== シミュレーション完了 ===");
        info!(
            triggers = stats.triggers,
            suppressed = stats.suppressed,
            fixes = summary.fixes,
            failed = summary.failed_fixes,
            contacts = summary.contacts,
            "試行統計"
        );
        if let Some(error) = summary.mean_error {
            info!("平均測位誤差: {:.2} m", error);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> ArrayConfig {
        let yaml = format!(
            r#"
correlation_window: 0.5
cooldown_duration: 2.0
passive_interval: 1.0
capture_timeout: 0.5
hydrophones:
  - {{ id: H1, x: 0.0, y: 0.0, z: 0.0 }}
  - {{ id: H2, x: 300.0, y: 0.0, z: 20.0 }}
  - {{ id: H3, x: 0.0, y: 300.0, z: 40.0 }}
  - {{ id: H4, x: 300.0, y: 300.0, z: 80.0 }}
  - {{ id: H5, x: 150.0, y: 150.0, z: 120.0 }}
simulation:
  t_max: 20.0
  source_start: [100.0, 120.0, 50.0]
  source_velocity: [1.0, 0.5, 0.0]
  ping_interval: 5.0
  capture_length: 2.0
  ack_latency: 0.01
{}"#,
            extra
        );
        let config: ArrayConfig = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_arrival_follows_propagation_delay() {
        let config = config("");
        let scenario = AcousticScenario::new(&config, config.simulation.clone().unwrap(), Instant::now());
        let receiver = Position3D::new(100.0, 120.0, 50.0 + 1480.0 * 0.2);

        // t=0 に発したシグネチャは 0.2 秒後に到達
        assert_eq!(scenario.latest_arrival(&receiver, 0.1), None);
        let (arrival, distance) = scenario.latest_arrival(&receiver, 0.5).unwrap();
        assert!((arrival - 0.2).abs() < 1e-9);
        assert!((distance - 296.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_and_faulty_nodes() {
        let config = config("  detection_range: 100.0\n  faulty: [H2]\n");
        let scenario = AcousticScenario::new(&config, config.simulation.clone().unwrap(), Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;

        let far = scenario.capture("H1").unwrap();
        assert!(!far.is_positive);
        assert!(matches!(scenario.capture("H2"), Err(SourceError::Io(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_peer_is_rejected() {
        let config = config("  unreachable: [H3]\n");
        let peers = SimulatedPeerLink::new(config.simulation.as_ref().unwrap());
        assert!(peers.send_capture_command("H2").await.is_ok());
        assert!(matches!(peers.send_capture_command("H3").await, Err(PeerError::Unreachable(_))));
    }

    #[test]
    fn test_engine_requires_simulation_section() {
        let mut config = config("");
        config.simulation = None;
        assert!(SimulationEngine::new(config, 0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_run_localizes_moving_source() {
        let mut engine = SimulationEngine::new(config(""), 0).unwrap();
        let summary = engine.run(Some(12.0)).await.unwrap();

        assert!(summary.fixes >= 2, "{:?}", summary);
        assert_eq!(summary.failed_fixes, 0);
        assert!(summary.mean_error.unwrap() < 0.5);
    }
}
