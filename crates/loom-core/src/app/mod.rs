//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **merge_lossy**: 並行数上限つき・溢れた trigger は捨てる merge
//! - **TaskScheduler**: ready task の評価、依存関係の更新、graph 完了判定
//! - **TaskRunner**: checkout → 実行 → 結果の永続化と通知
//! - **LeaseExpirationPoller**: 期限切れ lease の回収
//! - **CompletedTaskPoller**: 完了した task の回収
//! - **GraphService / GraphRegistry**: client 向け操作と定義カタログ
//! - **EngineBuilder**: 構築とワイヤリング

pub mod builder;
pub mod completed_poller;
pub mod completion;
pub mod lease_poller;
pub mod merge;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod task;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Engine, EngineBuilder, EngineStatus, Roles};
pub use self::completed_poller::CompletedTaskPoller;
pub use self::completion::{Completion, handle_potential_finished_graph};
pub use self::lease_poller::LeaseExpirationPoller;
pub use self::merge::{ConcurrencyCounter, StageStatus, merge_lossy};
pub use self::registry::{ActiveGraph, GraphFilter, GraphRegistry, GraphStatusView};
pub use self::runner::{RunnerStatus, TaskRunner};
pub use self::scheduler::{SchedulerStatus, TaskScheduler};
pub use self::service::GraphService;
pub use self::task::{CancelReason, TaskInstance, TaskStatusView};
