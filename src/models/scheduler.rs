use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::PeerError;
use crate::models::node::Node;
use crate::models::traits::PeerLink;

/// スキャンスケジューラ
///
/// ノードごとの受動スキャン周期を管理し、アレイ同期モードへの移行時には
/// 発信元以外の全ノードにキャプチャ指令を送出します。
/// 周期はレート制限であり、期限ではありません（設定間隔より早くは走査しない）。
pub struct ScanScheduler {
    /// ノードIDごとの最終スキャン時刻
    last_scan_time: HashMap<String, Instant>,
    peers: Arc<dyn PeerLink>,
    ack_timeout: Duration,
}

impl ScanScheduler {
    /// `ack_timeout` はノードごとのキャプチャ指令の応答待ち上限
    pub fn new(peers: Arc<dyn PeerLink>, ack_timeout: Duration) -> Self {
        Self {
            last_scan_time: HashMap::new(),
            peers,
            ack_timeout,
        }
    }

    /// ノードが受動スキャンの対象時刻に達しているか
    pub fn is_due(&self, node: &Node, now: Instant) -> bool {
        match self.last_scan_time.get(&node.id) {
            Some(last) => now.saturating_duration_since(*last) >= node.passive_interval,
            None => true,
        }
    }

    /// 受動スキャン対象のノードを返す
    pub fn due_nodes<'a>(&self, nodes: &'a [Node], now: Instant) -> Vec<&'a Node> {
        nodes.iter().filter(|node| self.is_due(node, now)).collect()
    }

    /// キャプチャを実行したノードの最終スキャン時刻を更新
    pub fn mark_scanned(&mut self, node_id: &str, now: Instant) {
        self.last_scan_time.insert(node_id.to_string(), now);
    }

    /// 最終スキャン時刻（未スキャンなら None）
    pub fn last_scan_time(&self, node_id: &str) -> Option<Instant> {
        self.last_scan_time.get(node_id).copied()
    }

    /// 発信元以外の全ノードに即時キャプチャを指令
    ///
    /// 指令は並列に送出され、各ノードの応答待ちは `ack_timeout` で打ち切られます。
    /// 応答したノードの集合を返し、その最終スキャン時刻を更新します。
    pub async fn broadcast_synchronized_capture(
        &mut self,
        nodes: &[Node],
        originating_node_id: &str,
    ) -> HashSet<String> {
        let mut pending = JoinSet::new();

        for node in nodes.iter().filter(|n| n.id != originating_node_id) {
            let peers = Arc::clone(&self.peers);
            let node_id = node.id.clone();
            let ack_timeout = self.ack_timeout;
            pending.spawn(async move {
                let result = match tokio::time::timeout(ack_timeout, peers.send_capture_command(&node_id)).await {
                    Ok(result) => result,
                    Err(_) => Err(PeerError::Timeout(node_id.clone())),
                };
                (node_id, result)
            });
        }

        let mut commanded = HashSet::new();
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok((node_id, Ok(()))) => {
                    debug!(node = %node_id, "キャプチャ指令 ack");
                    commanded.insert(node_id);
                }
                Ok((node_id, Err(e))) => {
                    warn!(node = %node_id, kind = %e.kind(), "キャプチャ指令失敗: {}", e);
                }
                Err(e) => {
                    warn!("キャプチャ指令タスクが異常終了: {}", e);
                }
            }
        }

        let now = Instant::now();
        for node_id in &commanded {
            self.mark_scanned(node_id, now);
        }

        commanded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::common::Position3D;
    use async_trait::async_trait;

    struct FlakyPeers {
        unreachable: Vec<&'static str>,
        silent: Vec<&'static str>,
    }

    #[async_trait]
    impl PeerLink for FlakyPeers {
        async fn send_capture_command(&self, node_id: &str) -> Result<(), PeerError> {
            if self.unreachable.contains(&node_id) {
                return Err(PeerError::Unreachable(node_id.to_string()));
            }
            if self.silent.contains(&node_id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }
    }

    fn nodes() -> Vec<Node> {
        ["H1", "H2", "H3", "H4"]
            .iter()
            .enumerate()
            .map(|(i, id)| Node::new(*id, Position3D::new(i as f64, 0.0, 0.0), Duration::from_secs(10)))
            .collect()
    }

    fn scheduler(peers: FlakyPeers) -> ScanScheduler {
        ScanScheduler::new(Arc::new(peers), Duration::from_millis(500))
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_due_respects_passive_interval() {
        let nodes = nodes();
        let mut sched = scheduler(FlakyPeers { unreachable: vec![], silent: vec![] });
        let start = Instant::now();

        assert!(sched.is_due(&nodes[0], start));
        sched.mark_scanned("H1", start);
        assert!(!sched.is_due(&nodes[0], start + Duration::from_secs(9)));
        assert!(sched.is_due(&nodes[0], start + Duration::from_secs(10)));
        assert_eq!(sched.due_nodes(&nodes, start).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_excludes_originator_and_failures() {
        let nodes = nodes();
        let mut sched = scheduler(FlakyPeers { unreachable: vec!["H3"], silent: vec!["H4"] });

        let started = Instant::now();
        let commanded = sched.broadcast_synchronized_capture(&nodes, "H1").await;

        assert_eq!(commanded, HashSet::from(["H2".to_string()]));
        assert!(started.elapsed() <= Duration::from_millis(600));
        assert!(sched.last_scan_time("H2").is_some());
        assert!(sched.last_scan_time("H3").is_none());
        assert!(sched.last_scan_time("H1").is_none());
    }
}
