//! 長さプレフィックス付きフレーミング
//!
//! ## Frame Wire Format
//! ```text
//! [len: unsigned LEB128 varint (1..=10 bytes)]
//! [envelope: len bytes]
//! ```
//!
//! データチャンネルの 1 メッセージが 1 フレームに対応するとは限らない。
//! [`FrameDecoder`] は任意の位置で分割されたチャンクを受け取り、
//! 到着順にフレームを取り出す。

use alloc::vec::Vec;

use prost::Message;

use crate::error::ProtoError;
use crate::Envelope;

/// u64 varint の最大バイト数
pub const MAX_VARINT_LEN: usize = 10;

/// Envelope を `varint(len) ++ envelope` にエンコードする
pub fn encode_frame(envelope: &Envelope) -> Vec<u8> {
    envelope.encode_length_delimited_to_vec()
}

/// フレームを再組み立てするデコーダ
///
/// 長さヘッダーやペイロードが途中で切れていても内部にバッファし、
/// フレームが揃った時点で [`next_frame`](FrameDecoder::next_frame) が返す。
///
/// エラーを返した後のデコーダは使わないこと（フレーム境界を見失っている）。
pub struct FrameDecoder {
    /// 未処理の受信バイト列
    buf: Vec<u8>,
    /// 1 フレーム（Envelope 部分）の最大バイト数
    max_frame_len: usize,
}

impl FrameDecoder {
    /// 新しい FrameDecoder を生成する
    ///
    /// # 引数
    /// - `max_frame_len`: 受け付ける Envelope の最大バイト数。
    ///   これを超える長さヘッダーは不正なプレフィックスとして扱う。
    pub fn new(max_frame_len: usize) -> Self {
        FrameDecoder {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// 受信したチャンクを積む
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 完成したフレームを 1 つ取り出す
    ///
    /// # 戻り値
    /// - `Ok(Some(envelope))`: フレームが揃った
    /// - `Ok(None)`: まだバイトが足りない
    ///
    /// # エラー
    /// - `ProtoError::MalformedLength`: varint が 10 バイトで終わらない
    /// - `ProtoError::FrameTooLarge`: 長さが上限超過
    /// - `ProtoError::DecodeFailed`: Envelope 本体の protobuf が壊れている
    pub fn next_frame(&mut self) -> Result<Option<Envelope>, ProtoError> {
        let Some((len, header_len)) = self.peek_length()? else {
            return Ok(None);
        };

        if len > self.max_frame_len {
            return Err(ProtoError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let total = header_len + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let envelope =
            Envelope::decode(&self.buf[header_len..total]).map_err(ProtoError::DecodeFailed)?;
        self.buf.drain(..total);
        Ok(Some(envelope))
    }

    /// 入力の終端で呼ぶ。途中のフレームが残っていればエラー。
    pub fn finish(&self) -> Result<(), ProtoError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtoError::Truncated {
                remaining: self.buf.len(),
            })
        }
    }

    /// 先頭の長さヘッダーを読む。`(len, header_len)` を返す。
    fn peek_length(&self) -> Result<Option<(usize, usize)>, ProtoError> {
        let end = self
            .buf
            .iter()
            .take(MAX_VARINT_LEN)
            .position(|b| b & 0x80 == 0);

        let Some(end) = end else {
            if self.buf.len() >= MAX_VARINT_LEN {
                return Err(ProtoError::MalformedLength);
            }
            return Ok(None);
        };

        let mut header = &self.buf[..=end];
        let len = prost::encoding::decode_varint(&mut header)
            .map_err(|_| ProtoError::MalformedLength)?;
        let len = usize::try_from(len).map_err(|_| ProtoError::MalformedLength)?;
        Ok(Some((len, end + 1)))
    }
}
