//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（graph store, message bus, 時刻, ID 生成）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//! Store が source of truth（正本）、Messenger は trigger の配送のみを担います。

pub mod clock;
pub mod id_generator;
pub mod messenger;
pub mod store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::messenger::{Messenger, Subscription};
pub use self::store::TaskGraphStore;
