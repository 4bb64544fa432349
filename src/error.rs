//! # Error モジュール
//!
//! 協調・測位エンジンのエラー分類を提供します。
//!
//! 設定読み込みエラーを除き、このモジュールのエラーはプロセスにとって致命的では
//! ありません。検知ソース障害とピア到達不能はノード単位で吸収され、測位失敗は
//! `position = None` の Fix として下流へ通知されます。

use std::path::PathBuf;
use thiserror::Error;

/// エラー分類（下流の通知やログで使用する種別）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 観測数が解に必要な数に満たない
    Underdetermined,
    /// 幾何配置が退化している（共面・共線）
    IllConditioned,
    /// 相関ウィンドウ外の到達記録
    StaleRecord,
    /// 起動コマンドが応答されなかった
    PeerUnreachable,
    /// 検知ソース（録音・分類器）が利用できない
    SourceUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Underdetermined => "UNDERDETERMINED",
            ErrorKind::IllConditioned => "ILL_CONDITIONED",
            ErrorKind::StaleRecord => "STALE_RECORD",
            ErrorKind::PeerUnreachable => "PEER_UNREACHABLE",
            ErrorKind::SourceUnavailable => "SOURCE_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 設定読み込みエラー（起動を中止する唯一のエラー）
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("設定ファイルが見つかりません: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("ファイル読み込みエラー {}: {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("YAML解析エラー {}: {1}", .0.display())]
    Parse(PathBuf, #[source] serde_yaml::Error),
    #[error("設定検証エラー: {0}")]
    Validation(String),
}

/// 検知ソース（録音 + 分類）の失敗
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("録音デバイスが利用できません: {0}")]
    Io(String),
    #[error("分類モデルが読み込まれていません")]
    ClassifierUnavailable,
    #[error("キャプチャがタイムアウトしました")]
    Timeout,
}

impl SourceError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SourceUnavailable
    }
}

/// ピア起動チャネルの失敗
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PeerError {
    #[error("ノード {0} からの応答がタイムアウトしました")]
    Timeout(String),
    #[error("ノード {0} に到達できません")]
    Unreachable(String),
}

impl PeerError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PeerUnreachable
    }
}

/// 測位ソルバーの失敗
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SolveError {
    #[error("観測数不足: {required} 必要, {available} 利用可能")]
    Underdetermined { required: usize, available: usize },
    #[error("配置が退化しています (条件数 {condition_number:.3e})")]
    IllConditioned { condition_number: f64 },
}

impl SolveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SolveError::Underdetermined { .. } => ErrorKind::Underdetermined,
            SolveError::IllConditioned { .. } => ErrorKind::IllConditioned,
        }
    }
}

/// 到達記録の永続化エラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("到達記録の書き込みに失敗 {}: {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("到達記録の解析に失敗 {}: {1}", .0.display())]
    Json(PathBuf, #[source] serde_json::Error),
}

/// 状態機械の不正遷移
#[derive(Debug, Clone, Error, PartialEq)]
#[error("不正な状態遷移: {from} 状態で {event} は受け付けられません")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: &'static str,
}
