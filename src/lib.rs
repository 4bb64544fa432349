//! # hydroarray
//!
//! 分散ハイドロフォンアレイの協調・音源定位エンジン。
//!
//! 各ノードは低頻度の受動スキャンで待機し、いずれかが陽性検知すると
//! アレイ全体に同期キャプチャを指令します。相関ウィンドウ内に集まった
//! 到達時刻から TDOA（到達時間差）法で音源位置を解き、直近の測位点列から
//! 速度と進行方向を推定します。

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod simulation;

pub use config::ArrayConfig;
pub use error::ErrorKind;
