//! ストリーム設定

use serde::{Deserialize, Serialize};

/// データチャンネル 1 メッセージの既定上限（libp2p-webrtc と同じ 16 KiB）
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// 受信フレームの既定上限（4 MiB）
///
/// 送信側が分割しない実装でも受け取れるよう、送信の分割サイズとは別に大きく取る。
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Envelope のオーバーヘッド見積もり（バイト）
/// - 長さプレフィックス varint: 最大 3（16 KiB 程度まで）
/// - message フィールドのタグ: 1
/// - message フィールドの長さ varint: 最大 3
///
/// 余裕を見て切り上げている。
pub const ENVELOPE_OVERHEAD: usize = 16;

/// ストリームの設定
///
/// JS 側からは JSON（camelCase）で渡せる。省略したフィールドは既定値。
///
/// ```json
/// { "maxMessageSize": 16384, "maxFrameLen": 4194304 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// 送信する 1 メッセージの最大バイト数。これに収まるように書き込みを分割する。
    pub max_message_size: usize,
    /// 受信する 1 フレーム（Envelope 部分）の最大バイト数。超える長さヘッダーは不正として扱う。
    pub max_frame_len: usize,
}

impl StreamConfig {
    /// 1 つのデータ Envelope に載せるペイロードの最大バイト数
    ///
    /// これより長い書き込みは複数の Envelope に分割して送る。
    pub fn max_payload_len(&self) -> usize {
        self.max_message_size.saturating_sub(ENVELOPE_OVERHEAD).max(1)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
