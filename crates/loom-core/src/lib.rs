//! loom-core
//!
//! Core building blocks of the Loom task-graph engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, state, task, graph, lease, events, definition, errors）
//! - **ports**: 抽象化レイヤー（TaskGraphStore, Messenger, Clock, IdGenerator）
//! - **app**: アプリケーションロジック（scheduler, runner, lease poller, service, builder）
//! - **impls**: 実装（InMemoryStore, InMemoryMessenger など開発用）
//! - **config**: TOML 設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use self::app::{Engine, EngineBuilder, Roles};
pub use self::config::{ConfigError, EngineConfig};
