use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::TransitionError;
use crate::models::common::{ArrayState, Timestamp};
use crate::models::node::DetectionSample;

/// アレイ全体を起動したトリガー
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub node_id: String,
    pub timestamp: Timestamp,
}

/// 集約結果に対する判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalizationDecision {
    /// 3D測位を実行する
    Localize,
    /// 測位には足りないが低信頼度コンタクトとして記録する
    Contact,
    /// 裏付けなし（単独ノードの誤トリガー）
    NoContact,
}

/// 状態機械の統計情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptStats {
    pub triggers: u64,
    pub localizations: u64,
    pub contacts: u64,
    pub no_contacts: u64,
    /// PASSIVE 以外で受けたため無視された陽性検知
    pub suppressed: u64,
}

/// 協調状態機械
///
/// `PASSIVE → ARRAY_CAPTURE → AGGREGATING → COOLDOWN → PASSIVE` を一方向に巡回します。
/// 部分的な裏付けでも再帰的に再起動することはなく、1回の試行の後は必ず不感時間を
/// 経て PASSIVE に戻ります。PASSIVE 以外の状態では新たなトリガーを受け付けません。
#[derive(Debug, Clone)]
pub struct CoordinationStateMachine {
    state: ArrayState,
    trigger: Option<Trigger>,
    aggregation_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
    min_nodes_for_3d: usize,
    min_nodes_for_contact: usize,
    cooldown: Duration,
    stats: AttemptStats,
}

impl CoordinationStateMachine {
    /// PASSIVE から開始する状態機械を作成
    pub fn new(min_nodes_for_3d: usize, min_nodes_for_contact: usize, cooldown: Duration) -> Self {
        Self {
            state: ArrayState::Passive,
            trigger: None,
            aggregation_deadline: None,
            cooldown_until: None,
            min_nodes_for_3d,
            min_nodes_for_contact,
            cooldown,
            stats: AttemptStats::default(),
        }
    }

    pub fn state(&self) -> ArrayState {
        self.state
    }

    /// 進行中の試行を起動したトリガー
    pub fn trigger(&self) -> Option<&Trigger> {
        self.trigger.as_ref()
    }

    pub fn stats(&self) -> &AttemptStats {
        &self.stats
    }

    pub fn aggregation_deadline(&self) -> Option<Instant> {
        self.aggregation_deadline
    }

    /// 受動スキャンの結果を受け取る
    ///
    /// PASSIVE 中の陽性検知のみが ARRAY_CAPTURE への遷移を起こします。
    pub fn on_passive_sample(&mut self, sample: &DetectionSample) -> Option<Trigger> {
        if !sample.is_positive {
            return None;
        }
        if self.state != ArrayState::Passive {
            self.stats.suppressed += 1;
            debug!(node = %sample.node_id, state = %self.state, "試行中のため陽性検知を無視");
            return None;
        }

        let trigger = Trigger {
            node_id: sample.node_id.clone(),
            timestamp: sample.timestamp,
        };
        info!(node = %trigger.node_id, t0 = trigger.timestamp, "陽性検知: アレイ同期キャプチャへ移行");
        self.state = ArrayState::ArrayCapture;
        self.trigger = Some(trigger.clone());
        self.stats.triggers += 1;
        Some(trigger)
    }

    /// 同期キャプチャ指令の送出完了（応答数に関わらず AGGREGATING へ）
    pub fn on_broadcast_issued(
        &mut self,
        commanded: usize,
        now: Instant,
        aggregation_timeout: Duration,
    ) -> Result<Instant, TransitionError> {
        if self.state != ArrayState::ArrayCapture {
            return Err(TransitionError { from: self.state.as_str(), event: "broadcast_issued" });
        }
        let deadline = now + aggregation_timeout;
        debug!(commanded, "同期キャプチャ指令完了: 集約待ちへ移行");
        self.state = ArrayState::Aggregating;
        self.aggregation_deadline = Some(deadline);
        Ok(deadline)
    }

    /// 集約ウィンドウが期限切れか
    pub fn aggregation_expired(&self, now: Instant) -> bool {
        self.state == ArrayState::Aggregating
            && self.aggregation_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// 陽性検知数を閾値で分類
    ///
    /// `corroborating` はトリガーノード以外の陽性検知数。トリガー自身しか
    /// 陽性でない場合は単独ノードの誤トリガーとして NoContact になります。
    pub fn classify(&self, positive_count: usize, corroborating: usize) -> LocalizationDecision {
        if positive_count >= self.min_nodes_for_3d {
            LocalizationDecision::Localize
        } else if corroborating == 0 {
            LocalizationDecision::NoContact
        } else if positive_count >= self.min_nodes_for_contact {
            LocalizationDecision::Contact
        } else {
            LocalizationDecision::NoContact
        }
    }

    /// 集約完了（またはウィンドウ期限切れ）。判定を返し COOLDOWN へ遷移
    pub fn on_aggregation_complete(
        &mut self,
        positive_count: usize,
        corroborating: usize,
        now: Instant,
    ) -> Result<LocalizationDecision, TransitionError> {
        if self.state != ArrayState::Aggregating {
            return Err(TransitionError { from: self.state.as_str(), event: "aggregation_complete" });
        }

        let decision = self.classify(positive_count, corroborating);
        match decision {
            LocalizationDecision::Localize => self.stats.localizations += 1,
            LocalizationDecision::Contact => self.stats.contacts += 1,
            LocalizationDecision::NoContact => self.stats.no_contacts += 1,
        }

        info!(positive_count, corroborating, ?decision, "集約完了: クールダウンへ移行");
        self.state = ArrayState::Cooldown;
        self.aggregation_deadline = None;
        self.cooldown_until = Some(now + self.cooldown);
        Ok(decision)
    }

    /// 時間経過の処理。COOLDOWN から PASSIVE へ戻った場合 true
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.state != ArrayState::Cooldown {
            return false;
        }
        match self.cooldown_until {
            Some(until) if now < until => false,
            _ => {
                debug!("クールダウン終了: 受動スキャンへ復帰");
                self.state = ArrayState::Passive;
                self.cooldown_until = None;
                self.trigger = None;
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> CoordinationStateMachine {
        CoordinationStateMachine::new(4, 1, Duration::from_secs(5))
    }

    #[test]
    fn test_threshold_partition() {
        let m = machine();
        assert_eq!(m.classify(0, 0), LocalizationDecision::NoContact);
        for count in 1..4 {
            assert_eq!(m.classify(count, count), LocalizationDecision::Contact);
        }
        assert_eq!(m.classify(4, 3), LocalizationDecision::Localize);
        assert_eq!(m.classify(12, 11), LocalizationDecision::Localize);
    }

    #[test]
    fn test_lone_trigger_is_not_a_contact() {
        let m = machine();
        assert_eq!(m.classify(1, 0), LocalizationDecision::NoContact);
        assert_eq!(m.classify(2, 1), LocalizationDecision::Contact);
        assert_eq!(m.classify(3, 2), LocalizationDecision::Contact);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_returns_to_passive() {
        let mut m = machine();
        let now = Instant::now();

        assert!(m.on_passive_sample(&DetectionSample::negative("H1", 1.0, 0.2)).is_none());
        assert_eq!(m.state(), ArrayState::Passive);

        let trigger = m.on_passive_sample(&DetectionSample::positive("H1", 1.0, 0.9)).unwrap();
        assert_eq!(trigger.node_id, "H1");
        assert_eq!(m.state(), ArrayState::ArrayCapture);

        let deadline = m.on_broadcast_issued(0, now, Duration::from_secs(2)).unwrap();
        assert_eq!(m.state(), ArrayState::Aggregating);
        assert!(!m.aggregation_expired(now));
        assert!(m.aggregation_expired(deadline));

        assert_eq!(m.on_aggregation_complete(2, 1, now).unwrap(), LocalizationDecision::Contact);
        assert_eq!(m.state(), ArrayState::Cooldown);

        assert!(!m.poll(now + Duration::from_secs(4)));
        assert!(m.poll(now + Duration::from_secs(5)));
        assert_eq!(m.state(), ArrayState::Passive);
        assert!(m.trigger().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_second_capture_while_busy() {
        let mut m = machine();
        let now = Instant::now();
        m.on_passive_sample(&DetectionSample::positive("H1", 1.0, 0.9)).unwrap();
        m.on_broadcast_issued(3, now, Duration::from_secs(2)).unwrap();

        assert!(m.on_passive_sample(&DetectionSample::positive("H2", 1.1, 0.9)).is_none());
        assert_eq!(m.state(), ArrayState::Aggregating);

        m.on_aggregation_complete(1, 0, now).unwrap();
        assert!(m.on_passive_sample(&DetectionSample::positive("H3", 1.2, 0.9)).is_none());
        assert_eq!(m.state(), ArrayState::Cooldown);
        assert_eq!(m.stats().suppressed, 2);
        assert_eq!(m.stats().triggers, 1);
        assert_eq!(m.stats().no_contacts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_transitions_are_rejected() {
        let mut m = machine();
        let now = Instant::now();
        assert!(m.on_broadcast_issued(1, now, Duration::from_secs(1)).is_err());
        assert!(m.on_aggregation_complete(4, 3, now).is_err());
        assert!(!m.poll(now));
        assert_eq!(m.state(), ArrayState::Passive);
    }
}
