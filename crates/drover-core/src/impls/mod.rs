//! Impls - ports の実装
//!
//! - **SbatchLauncher**: SLURM クラスタ向け
//! - **LocalLauncher**: 手元のマシンでワーカーを起動（開発・小規模実行用）

pub mod local;
pub mod sbatch;

pub use self::local::LocalLauncher;
pub use self::sbatch::{SbatchLauncher, parse_submission};
