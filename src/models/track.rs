use std::collections::VecDeque;

use crate::config::HeadingMode;
use crate::models::common::{Position3D, Timestamp, math_utils};
use crate::models::solver::Fix;

/// 進行方向
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Heading {
    /// XY平面上の方位角[deg]（x軸基準、反時計回り）
    Bearing(f64),
    /// 3次元の単位方向ベクトル
    Direction(Position3D),
}

/// 航跡に保持される測位点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub position: Position3D,
    pub timestamp: Timestamp,
}

/// 航跡推定器
///
/// 有効な Fix のみを最大 `capacity` 件保持し（古いものから破棄）、
/// 最古と最新の点から速度と進行方向を求めます。
/// 保持数が2未満のときは速度・方向とも未定義（0 ではない）です。
#[derive(Debug, Clone)]
pub struct TrackEstimator {
    points: VecDeque<TrackPoint>,
    capacity: usize,
    heading_mode: HeadingMode,
}

impl TrackEstimator {
    /// `capacity` 件まで保持する空の航跡を作成（0 は 1 として扱う）
    pub fn new(capacity: usize, heading_mode: HeadingMode) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            heading_mode,
        }
    }

    /// Fix を取り込む。失敗した Fix は取り込まず false を返す
    pub fn accept(&mut self, fix: &Fix) -> bool {
        match fix.position {
            Some(position) => {
                self.push(position, fix.timestamp);
                true
            }
            None => false,
        }
    }

    /// 測位点を末尾に追加し、容量超過時は最古の点を破棄
    pub fn push(&mut self, position: Position3D, timestamp: Timestamp) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(TrackPoint { position, timestamp });
    }

    /// 保持している測位点の数
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 古い順の測位点
    pub fn points(&self) -> impl Iterator<Item = &TrackPoint> {
        self.points.iter()
    }

    /// 最新の測位点
    pub fn latest(&self) -> Option<&TrackPoint> {
        self.points.back()
    }

    /// 最古点・最新点・経過時間。経過時間が正でなければ None
    fn span(&self) -> Option<(&TrackPoint, &TrackPoint, f64)> {
        if self.points.len() < 2 {
            return None;
        }
        let oldest = self.points.front()?;
        let newest = self.points.back()?;
        let elapsed = newest.timestamp - oldest.timestamp;
        if elapsed > 0.0 {
            Some((oldest, newest, elapsed))
        } else {
            None
        }
    }

    /// 速度[m/s]
    pub fn speed(&self) -> Option<f64> {
        self.span()
            .map(|(oldest, newest, elapsed)| (newest.position - oldest.position).norm() / elapsed)
    }

    /// 平均速度ベクトル[m/s]
    pub fn velocity(&self) -> Option<Position3D> {
        self.span()
            .map(|(oldest, newest, elapsed)| (newest.position - oldest.position) / elapsed)
    }

    /// 進行方向（経過時間が正でない場合、または移動量が0の場合は未定義）
    pub fn heading(&self) -> Option<Heading> {
        let (oldest, newest, _) = self.span()?;
        match self.heading_mode {
            HeadingMode::Bearing => {
                math_utils::bearing_xy(&oldest.position, &newest.position).map(Heading::Bearing)
            }
            HeadingMode::Vector => {
                let displacement = newest.position - oldest.position;
                let length = displacement.norm();
                if length > 0.0 {
                    Some(Heading::Direction(displacement / length))
                } else {
                    None
                }
            }
        }
    }

    /// 航跡を破棄する
    pub fn clear(&mut self) {
        self.points.clear();
    }
}
