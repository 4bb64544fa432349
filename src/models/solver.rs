//! # Solver モジュール
//!
//! 到達時刻差（TDOA）による音源位置の推定を提供します。
//!
//! 最も早い到達を基準観測 `(t0, p0)` とし、他の観測 `(ti, pi)` との差分から
//! 線形化された双曲線方程式を作ります。基準ノードから音源までの距離を `r0` とすると
//!
//! ```text
//! 2(pi − p0)·x = |pi|² − |p0|² − c²(ti − t0)² − 2c(ti − t0)·r0
//! ```
//!
//! となり、`A x = b − d r0` を特異値分解で最小二乗に解いて `x(r0) = u + v r0` を得ます。
//! 最後に `|x(r0) − p0| = r0` から `r0` の二次方程式を解くため、初期値に依存せず
//! 決定的に解が定まります。`A` の条件数が大きい（共面・共線配置）場合は
//! 数値的に意味のない解を返さず `IllConditioned` を報告します。

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{ErrorKind, SolveError};
use crate::models::aggregator::ObservationSet;
use crate::models::arrival_store::ArrivalRecord;
use crate::models::common::{Position3D, Timestamp};

/// 特異値分解による最小二乗解の打ち切り閾値
const SVD_EPS: f64 = 1e-12;

/// 解の次元
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveMode {
    /// 3次元の解（観測4以上）
    Spatial,
    /// 既知深度の平面上の解（観測3、明示的に設定された場合のみ）
    Planar,
}

/// ソルバー設定
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// 音速[m/s]
    pub sound_speed: f64,
    /// 観測3点での平面解を許可する
    pub planar_fallback: bool,
    /// 平面解で仮定する深度（None の場合は観測ノードzの平均）
    pub planar_depth: Option<f64>,
    /// これを超える条件数は退化配置とみなす
    pub max_condition_number: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            sound_speed: 1480.0,
            planar_fallback: false,
            planar_depth: None,
            max_condition_number: 1e6,
        }
    }
}

/// 1回の測位試行の結果
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    /// 推定位置（解けない場合は None）
    pub position: Option<Position3D>,
    /// 推定発音時刻（失敗時は基準到達時刻）
    pub timestamp: Timestamp,
    /// |A x − b| のノルム
    pub residual_norm: Option<f64>,
    pub failure: Option<SolveError>,
    pub observations: usize,
    pub mode: Option<SolveMode>,
    /// 時刻基準に選ばれたノード
    pub reference_node: Option<String>,
}

impl Fix {
    /// 位置が得られたか
    pub fn is_valid(&self) -> bool {
        self.position.is_some()
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(SolveError::kind)
    }
}

/// 測位解
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub position: Position3D,
    pub residual_norm: f64,
    /// 基準ノードから音源までの距離[m]
    pub reference_range: f64,
    pub reference_node: String,
    pub reference_time: Timestamp,
    pub condition_number: f64,
    pub mode: SolveMode,
}

impl Solution {
    /// 推定発音時刻
    pub fn emission_time(&self, sound_speed: f64) -> Timestamp {
        self.reference_time - self.reference_range / sound_speed
    }
}

/// 線形化された連立方程式 `A x = b − d r0`
struct LinearSystem {
    a: DMatrix<f64>,
    b: DVector<f64>,
    d: DVector<f64>,
    /// 基準ノード位置（解の次元に射影済み）
    p0: DVector<f64>,
    /// 平面解での基準ノードと仮定深度の差（3次元解では0）
    h0: f64,
}

/// TDOA測位ソルバー
#[derive(Debug, Clone)]
pub struct LocalizationSolver {
    config: SolverConfig,
}

impl LocalizationSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// 観測集合から Fix を作る
    ///
    /// 失敗は `position = None` の Fix として返し、エラーとして伝播させません。
    /// `fallback_time` は観測が空のときの Fix 時刻です。
    pub fn solve(&self, observations: &ObservationSet, fallback_time: Timestamp) -> Fix {
        let records = observations.records();
        match self.locate(records) {
            Ok(solution) => Fix {
                position: Some(solution.position),
                timestamp: solution.emission_time(self.config.sound_speed),
                residual_norm: Some(solution.residual_norm),
                failure: None,
                observations: records.len(),
                mode: Some(solution.mode),
                reference_node: Some(solution.reference_node),
            },
            Err(failure) => {
                let reference = earliest(records);
                Fix {
                    position: None,
                    timestamp: reference.map(|r| r.timestamp).unwrap_or(fallback_time),
                    residual_norm: None,
                    failure: Some(failure),
                    observations: records.len(),
                    mode: None,
                    reference_node: reference.map(|r| r.node_id.clone()),
                }
            }
        }
    }

    /// 観測から音源位置を推定
    pub fn locate(&self, records: &[ArrivalRecord]) -> Result<Solution, SolveError> {
        let k = records.len();
        let mode = if k >= 4 {
            SolveMode::Spatial
        } else if k == 3 && self.config.planar_fallback {
            SolveMode::Planar
        } else {
            return Err(SolveError::Underdetermined {
                required: if self.config.planar_fallback { 3 } else { 4 },
                available: k,
            });
        };

        let mut ordered: Vec<&ArrivalRecord> = records.iter().collect();
        ordered.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        let reference = ordered[0];

        let depth = match mode {
            SolveMode::Spatial => 0.0,
            SolveMode::Planar => self
                .config
                .planar_depth
                .unwrap_or_else(|| ordered.iter().map(|r| r.position.z).sum::<f64>() / k as f64),
        };
        let system = self.build_system(&ordered, mode, depth);

        let condition_number = condition_number(&system.a);
        if !(condition_number <= self.config.max_condition_number) {
            debug!(condition_number, "ジオメトリが退化しています");
            return Err(SolveError::IllConditioned { condition_number });
        }

        let svd = system.a.clone().svd(true, true);
        let u = svd
            .solve(&system.b, SVD_EPS)
            .map_err(|_| SolveError::IllConditioned { condition_number })?;
        let v = svd
            .solve(&(-system.d.clone()), SVD_EPS)
            .map_err(|_| SolveError::IllConditioned { condition_number })?;

        let centroid = centroid(&ordered, mode);
        let (x, r0, residual_norm) = select_root(&system, &u, &v, &centroid)
            .ok_or(SolveError::IllConditioned { condition_number })?;

        let position = match mode {
            SolveMode::Spatial => Position3D::new(x[0], x[1], x[2]),
            SolveMode::Planar => Position3D::new(x[0], x[1], depth),
        };

        Ok(Solution {
            position,
            residual_norm,
            reference_range: r0,
            reference_node: reference.node_id.clone(),
            reference_time: reference.timestamp,
            condition_number,
            mode,
        })
    }

    fn build_system(&self, ordered: &[&ArrivalRecord], mode: SolveMode, depth: f64) -> LinearSystem {
        let c = self.config.sound_speed;
        let dims = match mode {
            SolveMode::Spatial => 3,
            SolveMode::Planar => 2,
        };
        let reference = ordered[0];
        let p0 = reference.position;
        let rows = ordered.len() - 1;

        let mut a = DMatrix::zeros(rows, dims);
        let mut b = DVector::zeros(rows);
        let mut d = DVector::zeros(rows);

        for (row, record) in ordered.iter().skip(1).enumerate() {
            let pi = record.position;
            let dt = record.timestamp - reference.timestamp;
            for col in 0..dims {
                a[(row, col)] = 2.0 * (pi[col] - p0[col]);
            }
            let mut rhs = -c * c * dt * dt;
            for col in 0..dims {
                rhs += pi[col] * pi[col] - p0[col] * p0[col];
            }
            if mode == SolveMode::Planar {
                rhs += (depth - pi.z).powi(2) - (depth - p0.z).powi(2);
            }
            b[row] = rhs;
            d[row] = 2.0 * c * dt;
        }

        let h0 = match mode {
            SolveMode::Spatial => 0.0,
            SolveMode::Planar => depth - p0.z,
        };

        LinearSystem {
            a,
            b,
            d,
            p0: DVector::from_iterator(dims, (0..dims).map(|i| p0[i])),
            h0,
        }
    }
}

/// `|x(r0) − p0|² + h0² = r0²` を満たす r0 を選ぶ
///
/// 有効な根が複数ある場合は残差が小さい方、同程度ならアレイ重心に近い方を採用します。
fn select_root(
    system: &LinearSystem,
    u: &DVector<f64>,
    v: &DVector<f64>,
    centroid: &DVector<f64>,
) -> Option<(DVector<f64>, f64, f64)> {
    let w = u - &system.p0;
    let qa = v.dot(v) - 1.0;
    let qb = 2.0 * v.dot(&w);
    let qc = w.dot(&w) + system.h0 * system.h0;

    let mut roots = Vec::with_capacity(2);
    if qa.abs() < 1e-12 {
        if qb.abs() > 0.0 {
            roots.push(-qc / qb);
        }
    } else {
        let disc = qb * qb - 4.0 * qa * qc;
        if disc < 0.0 {
            // 観測誤差で実根がない場合は最接近点を採用
            roots.push((-qb / (2.0 * qa)).max(0.0));
        } else {
            let sq = disc.sqrt();
            roots.push((-qb + sq) / (2.0 * qa));
            roots.push((-qb - sq) / (2.0 * qa));
        }
    }

    let tolerance = 1e-9 * system.b.norm().max(1.0);
    let mut best: Option<(DVector<f64>, f64, f64, f64)> = None;
    for r0 in roots.into_iter().filter(|r| r.is_finite() && *r >= -1e-9) {
        let r0 = r0.max(0.0);
        let x = u + v * r0;
        let residual = (&system.a * &x + &system.d * r0 - &system.b).norm();
        let spread = (&x - centroid).norm();
        let better = match &best {
            None => true,
            Some((_, _, best_residual, best_spread)) => {
                residual < best_residual - tolerance
                    || ((residual - best_residual).abs() <= tolerance && spread < *best_spread)
            }
        };
        if better {
            best = Some((x, r0, residual, spread));
        }
    }

    best.map(|(x, r0, residual, _)| (x, r0, residual))
}

fn condition_number(a: &DMatrix<f64>) -> f64 {
    let singular = a.singular_values();
    let max = singular.max();
    let min = singular.min();
    if min <= f64::EPSILON * max * a.nrows().max(a.ncols()) as f64 {
        f64::INFINITY
    } else {
        max / min
    }
}

fn centroid(ordered: &[&ArrivalRecord], mode: SolveMode) -> DVector<f64> {
    let dims = match mode {
        SolveMode::Spatial => 3,
        SolveMode::Planar => 2,
    };
    let n = ordered.len() as f64;
    DVector::from_iterator(
        dims,
        (0..dims).map(|i| ordered.iter().map(|r| r.position[i]).sum::<f64>() / n),
    )
}

fn earliest(records: &[ArrivalRecord]) -> Option<&ArrivalRecord> {
    records.iter().min_by(|a, b| {
        a.timestamp
            .partial_cmp(&b.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const C: f64 = 1480.0;

    fn observe(nodes: &[[f64; 3]], source: Position3D, t_emit: f64) -> Vec<ArrivalRecord> {
        nodes
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let position = Position3D::new(p[0], p[1], p[2]);
                ArrivalRecord {
                    node_id: format!("H{}", i + 1),
                    timestamp: t_emit + (source - position).norm() / C,
                    position,
                    is_positive: true,
                    confidence: 1.0,
                    source_reference: None,
                }
            })
            .collect()
    }

    fn unit_cube() -> Vec<[f64; 3]> {
        let mut corners = Vec::new();
        for x in [0.0, 1.0] {
            for y in [0.0, 1.0] {
                for z in [0.0, 1.0] {
                    corners.push([x, y, z]);
                }
            }
        }
        corners
    }

    fn solver() -> LocalizationSolver {
        LocalizationSolver::new(SolverConfig { sound_speed: C, ..SolverConfig::default() })
    }

    #[test]
    fn test_recovers_source_in_unit_cube() {
        let solver = solver();
        for source in [
            Position3D::new(0.5, 0.5, 0.5),
            Position3D::new(0.2, 0.7, 0.4),
            Position3D::new(3.0, -2.0, 1.5),
            Position3D::new(25.0, 40.0, -10.0),
        ] {
            let solution = solver.locate(&observe(&unit_cube(), source, 100.0)).unwrap();
            assert!((solution.position - source).norm() < 0.05, "source {:?} -> {:?}", source, solution.position);
            assert_eq!(solution.mode, SolveMode::Spatial);
        }
    }

    #[test]
    fn test_recovers_source_with_four_nodes() {
        let tetra = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let solver = solver();
        for source in [Position3D::new(0.5, 0.5, 0.5), Position3D::new(0.1, 0.1, 0.1)] {
            let solution = solver.locate(&observe(&tetra, source, 0.0)).unwrap();
            assert!((solution.position - source).norm() < 0.05);
        }

        let array = [[0.0, 0.0, 0.0], [200.0, 0.0, 5.0], [0.0, 200.0, 10.0], [100.0, 100.0, 80.0]];
        let source = Position3D::new(120.0, 60.0, 30.0);
        let solution = solver.locate(&observe(&array, source, 50.0)).unwrap();
        assert!((solution.position - source).norm() < 0.05);
    }

    #[test]
    fn test_reference_is_earliest_arrival() {
        let array = [[0.0, 0.0, 0.0], [200.0, 0.0, 5.0], [0.0, 200.0, 10.0], [200.0, 200.0, 40.0], [100.0, 100.0, 80.0]];
        let source = Position3D::new(190.0, 180.0, 35.0);
        let solution = solver().locate(&observe(&array, source, 10.0)).unwrap();
        assert_eq!(solution.reference_node, "H4");
        assert!((solution.emission_time(C) - 10.0).abs() < 1e-6);
        assert!((solution.position - source).norm() < 0.05);
    }

    #[test]
    fn test_fewer_than_four_is_underdetermined() {
        let solver = solver();
        let three = observe(&[[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]], Position3D::new(3.0, 4.0, 0.0), 0.0);
        for k in 0..=3 {
            let set = ObservationSet::from(three[..k].to_vec());
            let fix = solver.solve(&set, 7.0);
            assert!(!fix.is_valid());
            assert_eq!(fix.failure_kind(), Some(ErrorKind::Underdetermined));
        }
        assert_eq!(solver.solve(&ObservationSet::default(), 7.0).timestamp, 7.0);
    }

    #[test]
    fn test_coplanar_nodes_are_ill_conditioned() {
        let flat = [[0.0, 0.0, 0.0], [100.0, 0.0, 0.0], [0.0, 100.0, 0.0], [100.0, 100.0, 0.0]];
        let records = observe(&flat, Position3D::new(30.0, 40.0, 20.0), 0.0);
        let fix = solver().solve(&ObservationSet::from(records), 0.0);
        assert!(fix.position.is_none());
        assert_eq!(fix.failure_kind(), Some(ErrorKind::IllConditioned));
    }

    #[test]
    fn test_planar_fallback_with_three_nodes() {
        let nodes = [[0.0, 0.0, 10.0], [100.0, 0.0, 12.0], [0.0, 100.0, 8.0]];
        let source = Position3D::new(30.0, 40.0, 10.0);
        let solver = LocalizationSolver::new(SolverConfig {
            sound_speed: C,
            planar_fallback: true,
            planar_depth: Some(10.0),
            ..SolverConfig::default()
        });
        let fix = solver.solve(&ObservationSet::from(observe(&nodes, source, 5.0)), 0.0);
        let position = fix.position.unwrap();
        assert_eq!(fix.mode, Some(SolveMode::Planar));
        assert!(fix.is_valid());
        assert!((position - source).norm() < 0.05);
        assert!(fix.residual_norm.unwrap() < 1e-3);
    }
}
