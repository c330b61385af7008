//! ストリーム統計（方向とタイムライン）

use serde::{Deserialize, Serialize};

/// ストリームの方向（生成後は変わらない）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// 相手が開いたストリーム
    Inbound,
    /// こちらが開いたストリーム
    Outbound,
}

/// 開閉時刻（Unix 時刻ミリ秒）
///
/// `open` / `close` はそれぞれ高々 1 回だけ設定される。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub open: Option<u64>,
    pub close: Option<u64>,
}

/// ストリーム統計
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStat {
    pub direction: Direction,
    pub timeline: Timeline,
}

impl StreamStat {
    /// まだ開いていない状態の統計
    pub fn new(direction: Direction) -> Self {
        StreamStat {
            direction,
            timeline: Timeline::default(),
        }
    }
}
