// 基本的なデータ型と数学ユーティリティ
pub mod common;

// 検知ソース・ピア通信・結果出口のインターフェース（trait）定義
pub mod traits;

// アレイを構成する各コンポーネント
pub mod node;
pub mod scheduler;
pub mod arrival_store;
pub mod aggregator;
pub mod solver;
pub mod track;
pub mod state_machine;
pub mod coordinator;
pub mod sink;

// 便利な re-export
pub use common::*;
pub use traits::*;
pub use node::{Node, DetectionSample};
pub use scheduler::ScanScheduler;
pub use arrival_store::{ArrivalRecord, ArrivalStore};
pub use aggregator::{ArrivalAggregator, AggregationOutcome, ObservationSet, StaleRecord};
pub use solver::{Fix, LocalizationSolver, Solution, SolveMode, SolverConfig};
pub use track::{Heading, TrackEstimator, TrackPoint};
pub use state_machine::{AttemptStats, CoordinationStateMachine, LocalizationDecision, Trigger};
pub use coordinator::Coordinator;
pub use sink::{ArrayEvent, ChannelSink, LogSink};
