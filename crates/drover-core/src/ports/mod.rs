//! Ports - 外部システムとの境界
//!
//! バッチスケジューラ（SLURM など）はここの trait の向こう側にいる。
//! 実装は `impls` に置く。

pub mod launcher;

pub use self::launcher::{LaunchError, LaunchRequest, Launcher};
