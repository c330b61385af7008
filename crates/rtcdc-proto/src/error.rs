//! rtcdc-proto エラー型

/// フレームのデコードエラー
///
/// いずれもそのストリームの受信側にとって致命的で、復旧は試みない。
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗（Envelope 本体が壊れている）
    #[error("Envelope decode failed: {0}")]
    DecodeFailed(prost::DecodeError),
    /// 長さプレフィックスの varint が不正（10 バイトを超える、または usize に収まらない）
    #[error("Malformed length prefix")]
    MalformedLength,
    /// 長さプレフィックスが上限を超えている
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },
    /// 入力の終端でフレームが途中までしか届いていない
    #[error("Truncated frame: {remaining} bytes left at end of stream")]
    Truncated { remaining: usize },
}
