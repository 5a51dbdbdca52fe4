//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryStore**: 単一プロセス用の graph store（正本）
//! - **InMemoryMessenger**: 単一プロセス用の message bus
//!
//! 本番用の Store / Messenger（DB, message broker）は別クレートで
//! 同じ trait を実装します。

pub mod memory_messenger;
pub mod memory_store;

pub use self::memory_messenger::InMemoryMessenger;
pub use self::memory_store::{FaultPoint, InMemoryStore};
