//! Ports - 抽象化レイヤー
//!
//! 時刻と ID 生成を注入可能にするための trait です。
//! Broker 自体のポートは `crate::broker` にあります。

pub mod clock;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
