use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::track::Heading;
use crate::models::traits::{ContactReport, FixReport, FixSink};

/// 測位結果をログに出力するシンク
#[derive(Debug, Clone, Default)]
pub struct LogSink;

impl FixSink for LogSink {
    fn on_fix(&self, report: &FixReport) {
        match report.position {
            Some(p) => {
                info!(
                    x = p.x, y = p.y, z = p.z,
                    residual = report.residual_norm.unwrap_or(f64::NAN),
                    observations = report.observations,
                    "音源位置 ({:8.1}, {:8.1}, {:8.1}) m", p.x, p.y, p.z
                );
                if let Some(speed) = report.speed {
                    match report.heading {
                        Some(Heading::Bearing(deg)) => info!("速度 {:5.2} m/s 方位 {:05.1}°", speed, deg),
                        Some(Heading::Direction(d)) => {
                            info!("速度 {:5.2} m/s 方向 ({:.3}, {:.3}, {:.3})", speed, d.x, d.y, d.z)
                        }
                        None => info!("速度 {:5.2} m/s", speed),
                    }
                }
                if let Some(v) = report.velocity {
                    debug!(vx = v.x, vy = v.y, vz = v.z, "速度ベクトル");
                }
            }
            None => {
                let kind = report.failure_kind.map(|k| k.as_str()).unwrap_or("UNKNOWN");
                warn!(kind, observations = report.observations, "測位失敗");
            }
        }
    }

    fn on_contact(&self, contact: &ContactReport) {
        info!(
            trigger = %contact.trigger_node,
            positive_count = contact.positive_count,
            "コンタクト記録（測位には観測不足）"
        );
    }
}

/// 下流（警報・可視化）へのイベント
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayEvent {
    /// 測位試行の結果（失敗を含む）
    Fix(FixReport),
    /// 測位に至らない低信頼度コンタクト
    Contact(ContactReport),
}

/// チャネル経由で下流タスクに配信するシンク
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<ArrayEvent>,
}

impl ChannelSink {
    /// シンクと、下流タスクが保持する受信側を作成
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ArrayEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FixSink for ChannelSink {
    fn on_fix(&self, report: &FixReport) {
        if self.sender.send(ArrayEvent::Fix(report.clone())).is_err() {
            warn!("受信側が閉じているため測位結果を破棄");
        }
    }

    fn on_contact(&self, contact: &ContactReport) {
        if self.sender.send(ArrayEvent::Contact(contact.clone())).is_err() {
            warn!("受信側が閉じているためコンタクトを破棄");
        }
    }
}
