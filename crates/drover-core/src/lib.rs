//! drover-core
//!
//! Building blocks for the drover cluster job coordinator.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, outcome, run_record）
//! - **wire**: coordinator と worker の間のフレーム codec とメッセージ
//! - **store**: グラフファイル、journal、persister、meta log
//! - **queue**: 依存エンジン（Ready / Running）と retry 判定
//! - **ports**: 抽象化レイヤー（Launcher）
//! - **impls**: Launcher 実装（sbatch, local）
//! - **app**: coordinator（slot table, connection actor, event loop）
//! - **agent**: worker agent（handshake, IDLE/RUNNING, 出力キャプチャ）
//! - **observability**: 進捗カウンタとグラフ要約
//! - **error**: coordinator を止めるエラー

pub mod agent;
pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod store;
pub mod wire;

pub use error::DroverError;
