//! PayloadCodec - payload bytes と Task の相互変換
//!
//! payload は JSON で保存します。Broker からは不透明な bytes に見えます。

use thiserror::Error;

use super::task::Task;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode '{task_type}' payload: {source}")]
    Encode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode '{task_type}' payload: {source}")]
    Decode {
        task_type: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// PayloadCodec は Task を payload bytes に変換する
///
/// # デシリアライズフロー
/// 1. Broker から envelope の payload bytes を受け取る
/// 2. serde_json で T にデシリアライズ
/// 3. 失敗時は `CodecError::Decode`（handler 側では permanent failure 扱い）
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadCodec;

impl PayloadCodec {
    pub fn encode<T: Task>(task: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(task).map_err(|source| CodecError::Encode {
            task_type: T::TYPE,
            source,
        })
    }

    pub fn decode<T: Task>(payload: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(payload).map_err(|source| CodecError::Decode {
            task_type: T::TYPE,
            source,
        })
    }
}
