//! Task trait - 型付き Task の定義
//!
//! task_type の文字列と payload の型を 1 箇所で対応付けます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ResizeImage {
///     path: String,
/// }
///
/// impl Task for ResizeImage {
///     const TYPE: &'static str = "media.resize_image.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に payload bytes へ変換するため
/// - `DeserializeOwned`: dispatch 時に payload bytes から復元するため
/// - `Send + Sync + 'static`: slot 間で共有される handler に渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - 互換性のない payload 変更はサフィックスを上げる（`.v1` → `.v2`）
    const TYPE: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::Task;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestTask {
        pub value: i32,
    }

    impl Task for TestTask {
        const TYPE: &'static str = "test.task.create.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AnotherTestTask {
        pub name: String,
        pub family: HashMap<String, String>,
    }

    impl Task for AnotherTestTask {
        const TYPE: &'static str = "test.task.another.v1";
    }
}
