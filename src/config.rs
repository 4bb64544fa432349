//! # Config モジュール
//!
//! ハイドロフォンアレイの設定ファイル（YAML）を読み込み、検証します。
//!
//! 設定は起動時に一度だけ読み込まれ、以後は読み取り専用として共有されます。
//! ノードリストの欠落や不正値は起動そのものを中止させる唯一の致命的エラーです。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::common::Position3D;
use crate::models::node::Node;

fn default_sound_speed() -> f64 { 1480.0 }
fn default_min_nodes_for_3d() -> usize { 4 }
fn default_min_nodes_for_contact() -> usize { 1 }
fn default_track_window() -> usize { 5 }
fn default_cooldown() -> f64 { 5.0 }
fn default_passive_interval() -> f64 { 10.0 }
fn default_capture_timeout() -> f64 { 2.0 }
fn default_peer_ack_timeout() -> f64 { 0.5 }
fn default_max_condition_number() -> f64 { 1e6 }
fn default_tick_interval() -> f64 { 0.1 }

/// ハイドロフォン（ノード）設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HydrophoneConfig {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// ノード個別の受動スキャン間隔[s]（省略時は全体設定）
    #[serde(default)]
    pub passive_interval: Option<f64>,
}

/// 進行方位の表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadingMode {
    /// XY平面への投影による方位角[deg]
    #[default]
    Bearing,
    /// 3次元の単位方向ベクトル
    Vector,
}

/// シミュレーション環境の設定（CLI実行用）
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationSettings {
    /// 実行時間[s]
    pub t_max: f64,
    /// 音源の初期位置[m]
    pub source_start: [f64; 3],
    /// 音源の速度[m/s]
    pub source_velocity: [f64; 3],
    /// 音源がシグネチャを発する間隔[s]
    #[serde(default = "SimulationSettings::default_ping_interval")]
    pub ping_interval: f64,
    /// 探知距離[m]
    #[serde(default = "SimulationSettings::default_detection_range")]
    pub detection_range: f64,
    /// 1回のキャプチャで遡る録音長[s]
    #[serde(default = "SimulationSettings::default_capture_length")]
    pub capture_length: f64,
    /// 起動コマンドの応答遅延[s]
    #[serde(default = "SimulationSettings::default_ack_latency")]
    pub ack_latency: f64,
    /// 起動コマンドに応答しないノード
    #[serde(default)]
    pub unreachable: Vec<String>,
    /// 録音・分類に失敗するノード
    #[serde(default)]
    pub faulty: Vec<String>,
}

impl SimulationSettings {
    fn default_ping_interval() -> f64 { 1.0 }
    fn default_detection_range() -> f64 { 2000.0 }
    fn default_capture_length() -> f64 { 1.0 }
    fn default_ack_latency() -> f64 { 0.05 }
}

/// アレイ全体の設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArrayConfig {
    /// 音速[m/s]
    #[serde(default = "default_sound_speed")]
    pub sound_speed: f64,
    pub hydrophones: Vec<HydrophoneConfig>,
    /// 相関ウィンドウ[s]
    pub correlation_window: f64,
    #[serde(default = "default_min_nodes_for_3d")]
    pub min_nodes_for_3d: usize,
    #[serde(default = "default_min_nodes_for_contact")]
    pub min_nodes_for_contact: usize,
    #[serde(default = "default_track_window")]
    pub track_window: usize,
    /// 測位試行後の不感時間[s]
    #[serde(default = "default_cooldown")]
    pub cooldown_duration: f64,
    /// 受動スキャン間隔の既定値[s]
    #[serde(default = "default_passive_interval")]
    pub passive_interval: f64,
    /// ノード単位のキャプチャ＋分類のタイムアウト[s]
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout: f64,
    /// 起動コマンド応答のタイムアウト[s]
    #[serde(default = "default_peer_ack_timeout")]
    pub peer_ack_timeout: f64,
    /// 集約待ちのタイムアウト[s]（省略時は correlation_window + capture_timeout）
    #[serde(default)]
    pub aggregation_timeout: Option<f64>,
    /// 観測3点での平面解を許可する
    #[serde(default)]
    pub planar_fallback: bool,
    /// 平面解で仮定する深度[m]（省略時はノードzの平均）
    #[serde(default)]
    pub planar_depth: Option<f64>,
    #[serde(default)]
    pub heading_mode: HeadingMode,
    #[serde(default = "default_max_condition_number")]
    pub max_condition_number: f64,
    /// 協調ループのポーリング周期[s]
    #[serde(default = "default_tick_interval")]
    pub tick_interval: f64,
    /// 到達記録の永続化ディレクトリ
    #[serde(default)]
    pub arrival_store_dir: Option<PathBuf>,
    #[serde(default)]
    pub simulation: Option<SimulationSettings>,
}

impl ArrayConfig {
    /// YAMLファイルから設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        let config: ArrayConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        config.validate()?;

        Ok(config)
    }

    /// 設定の検証
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hydrophones.is_empty() {
            return Err(ConfigError::Validation("hydrophones must not be empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for h in &self.hydrophones {
            if h.id.trim().is_empty() {
                return Err(ConfigError::Validation("hydrophone id must not be empty".to_string()));
            }
            if !seen.insert(h.id.as_str()) {
                return Err(ConfigError::Validation(format!("duplicate hydrophone id {}", h.id)));
            }
            if !(h.x.is_finite() && h.y.is_finite() && h.z.is_finite()) {
                return Err(ConfigError::Validation(format!("hydrophone {} has non-finite position", h.id)));
            }
            if let Some(interval) = h.passive_interval {
                if !(interval >= 0.0) {
                    return Err(ConfigError::Validation(format!("hydrophone {} passive_interval must be >= 0", h.id)));
                }
            }
        }

        if !(self.sound_speed > 0.0) {
            return Err(ConfigError::Validation("sound_speed must be positive".to_string()));
        }
        if !(self.correlation_window > 0.0) {
            return Err(ConfigError::Validation("correlation_window must be positive".to_string()));
        }
        if !(self.cooldown_duration >= 0.0) {
            return Err(ConfigError::Validation("cooldown_duration must be >= 0".to_string()));
        }
        if !(self.passive_interval >= 0.0) {
            return Err(ConfigError::Validation("passive_interval must be >= 0".to_string()));
        }
        if !(self.capture_timeout > 0.0) || !(self.peer_ack_timeout > 0.0) {
            return Err(ConfigError::Validation("capture_timeout and peer_ack_timeout must be positive".to_string()));
        }
        if let Some(t) = self.aggregation_timeout {
            if !(t > 0.0) {
                return Err(ConfigError::Validation("aggregation_timeout must be positive".to_string()));
            }
        }
        if !(self.tick_interval > 0.0) {
            return Err(ConfigError::Validation("tick_interval must be positive".to_string()));
        }
        if self.track_window < 2 {
            return Err(ConfigError::Validation("track_window must be >= 2".to_string()));
        }

        let min_3d_floor = if self.planar_fallback { 3 } else { 4 };
        if self.min_nodes_for_3d < min_3d_floor {
            return Err(ConfigError::Validation(format!(
                "min_nodes_for_3d must be >= {}", min_3d_floor
            )));
        }
        if self.min_nodes_for_contact < 1 || self.min_nodes_for_contact > self.min_nodes_for_3d {
            return Err(ConfigError::Validation(
                "min_nodes_for_contact must satisfy 1 <= min_nodes_for_contact <= min_nodes_for_3d".to_string()
            ));
        }
        if !(self.max_condition_number > 1.0) {
            return Err(ConfigError::Validation("max_condition_number must be > 1".to_string()));
        }

        if let Some(sim) = &self.simulation {
            if !(sim.t_max > 0.0) || !(sim.ping_interval > 0.0) || !(sim.capture_length > 0.0) {
                return Err(ConfigError::Validation(
                    "simulation t_max, ping_interval and capture_length must be positive".to_string()
                ));
            }
        }

        Ok(())
    }

    /// 設定からノードリストを構築
    pub fn nodes(&self) -> Vec<Node> {
        self.hydrophones
            .iter()
            .map(|h| Node {
                id: h.id.clone(),
                position: Position3D::new(h.x, h.y, h.z),
                passive_interval: Duration::from_secs_f64(
                    h.passive_interval.unwrap_or(self.passive_interval)
                ),
            })
            .collect()
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_duration)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.capture_timeout)
    }

    pub fn peer_ack_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.peer_ack_timeout)
    }

    pub fn aggregation_timeout(&self) -> Duration {
        Duration::from_secs_f64(
            self.aggregation_timeout
                .unwrap_or(self.correlation_window + self.capture_timeout)
        )
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(self.tick_interval)
    }

    /// 設定の概要を表示
    pub fn print_summary(&self) {
        println!("=== アレイ設定 ===");
        println!("音速: {:.1} m/s", self.sound_speed);
        println!("相関ウィンドウ: {:.3}秒", self.correlation_window);
        println!("3D測位の最小ノード数: {}", self.min_nodes_for_3d);
        println!("コンタクトの最小ノード数: {}", self.min_nodes_for_contact);
        println!("航跡ウィンドウ: {}", self.track_window);
        println!("クールダウン: {:.1}秒", self.cooldown_duration);
        println!("平面解フォールバック: {}", if self.planar_fallback { "有効" } else { "無効" });
        println!();

        println!("=== ハイドロフォン ===");
        for h in &self.hydrophones {
            println!(
                "  {}: ({:.1}, {:.1}, {:.1}) 受動間隔 {:.1}秒",
                h.id, h.x, h.y, h.z,
                h.passive_interval.unwrap_or(self.passive_interval)
            );
        }

        if let Some(sim) = &self.simulation {
            println!();
            println!("=== シミュレーション ===");
            println!("実行時間: {:.1}秒", sim.t_max);
            println!(
                "音源: 初期位置 ({:.1}, {:.1}, {:.1}) 速度 ({:.2}, {:.2}, {:.2}) m/s",
                sim.source_start[0], sim.source_start[1], sim.source_start[2],
                sim.source_velocity[0], sim.source_velocity[1], sim.source_velocity[2]
            );
            if !sim.unreachable.is_empty() {
                println!("到達不能ノード: {}", sim.unreachable.join(", "));
            }
            if !sim.faulty.is_empty() {
                println!("故障ノード: {}", sim.faulty.join(", "));
            }
        }
    }
}
