//! App - coordinator 側のアプリケーション層
//!
//! # 主要コンポーネント
//! - **CoordinatorConfig**: 設定（TOML + CLI 上書き）
//! - **SlotTable**: worker slot の arena と索引
//! - **connection**: ソケットごとの actor
//! - **Coordinator**: event loop 本体

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod slots;

pub use self::config::{ConfigError, CoordinatorConfig};
pub use self::connection::{ConnEvent, ConnId, Directive, Report, Welcome};
pub use self::coordinator::{Coordinator, RunReport};
pub use self::slots::{Slot, SlotState, SlotTable};
