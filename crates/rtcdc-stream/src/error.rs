//! rtcdc-stream エラー型

use rtcdc_proto::ProtoError;

use crate::channel::ChannelError;

/// ストリーム層のエラー
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// 受信フレームのデコード失敗（受信側にとって致命的）
    #[error(transparent)]
    Proto(#[from] ProtoError),
    /// 下位のデータチャンネルでのエラー
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// 書き込みハンドルはすでに閉じている
    #[error("Stream writer is closed")]
    WriterClosed,
    /// ローカルで発生したエラーによる中断
    #[error("Stream aborted: {0}")]
    Aborted(String),
}
