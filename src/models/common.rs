use nalgebra::Vector3;

/// 3次元位置 [m]（x: 東, y: 北, z: 深度）
pub type Position3D = Vector3<f64>;

/// イベント時刻（エポックからの経過秒数）
pub type Timestamp = f64;

/// 協調状態機械の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayState {
    /// 各ノードが個別に受動スキャン中
    Passive,
    /// アレイ全体への同期キャプチャ指令中
    ArrayCapture,
    /// 到達記録の集約待ち
    Aggregating,
    /// 測位試行後の不感時間
    Cooldown,
}

impl ArrayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArrayState::Passive => "PASSIVE",
            ArrayState::ArrayCapture => "ARRAY_CAPTURE",
            ArrayState::Aggregating => "AGGREGATING",
            ArrayState::Cooldown => "COOLDOWN",
        }
    }
}

impl std::fmt::Display for ArrayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    use super::Position3D;

    /// 角度を-180度〜180度の範囲に正規化
    pub fn normalize_angle(angle_deg: f64) -> f64 {
        let mut normalized = angle_deg % 360.0;
        if normalized > 180.0 {
            normalized -= 360.0;
        } else if normalized <= -180.0 {
            normalized += 360.0;
        }
        normalized
    }

    /// XY平面での from → to の方位角（x軸基準、反時計回り、度）
    pub fn bearing_xy(from: &Position3D, to: &Position3D) -> Option<f64> {
        let dx = to.x - from.x;
        let dy = to.y - from.y;
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        Some(normalize_angle(dy.atan2(dx).to_degrees()))
    }
}

#[cfg(test)]
mod tests {
    use super::math_utils::*;
    use super::*;

    #[test]
    fn test_normalize_angle() {
        assert_eq!(normalize_angle(190.0), -170.0);
        assert_eq!(normalize_angle(-180.0), 180.0);
        assert_eq!(normalize_angle(45.0), 45.0);
    }

    #[test]
    fn test_bearing_xy() {
        let origin = Position3D::zeros();
        let b = bearing_xy(&origin, &Position3D::new(3.0, 4.0, 10.0)).unwrap();
        assert!((b - 53.130_102_354).abs() < 1e-6);
        assert!(bearing_xy(&origin, &Position3D::new(0.0, 0.0, 5.0)).is_none());
    }
}
