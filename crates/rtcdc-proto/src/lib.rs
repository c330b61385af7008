//! # rtcdc-proto
//!
//! WebRTC データチャンネル上のストリームで使う Protobuf Envelope と、
//! 長さプレフィックス付きフレーミング。
//!
//! ## Wire Format
//!
//! ```text
//! [varint(len(envelope))][envelope: protobuf]
//!
//! envelope:
//!   optional Flag  flag    = 1;   // STOP_SENDING=0, FIN=1, RESET=2
//!   optional bytes message = 2;
//! ```
//!
//! データ Envelope は `message` だけ、制御 Envelope は `flag` だけを持つ。
//! 受信側はデータチャンネルのメッセージ境界を信用せず、長さプレフィックスから
//! フレーム境界を復元する（[`FrameDecoder`]）。

#![no_std]
extern crate alloc;

use alloc::vec::Vec;

pub mod error;
pub mod frame;

pub use error::ProtoError;
pub use frame::{encode_frame, FrameDecoder, MAX_VARINT_LEN};

/// 制御フラグ
///
/// 数値は wire 上の enum 値。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Flag {
    /// 相手はこれ以上こちらのデータを読まない（こちらの書き込み側を閉じる合図）
    StopSending = 0,
    /// 相手はこれ以上データを送らない
    Fin = 1,
    /// 相手の送信が異常終了した
    Reset = 2,
}

/// データチャンネル上の 1 フレーム分のメッセージ
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(enumeration = "Flag", optional, tag = "1")]
    pub flag: Option<i32>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub message: Option<Vec<u8>>,
}

impl Envelope {
    /// ペイロードだけを持つデータ Envelope
    pub fn data(payload: Vec<u8>) -> Self {
        Envelope {
            flag: None,
            message: Some(payload),
        }
    }

    /// フラグだけを持つ制御 Envelope
    pub fn control(flag: Flag) -> Self {
        Envelope {
            flag: Some(flag as i32),
            message: None,
        }
    }

    /// 既知の制御フラグ
    ///
    /// フラグ無し、または未知の数値の場合は `None`。
    /// 未知の値は前方互換のため無視する（エラーにはしない）。
    pub fn control_flag(&self) -> Option<Flag> {
        self.flag.and_then(|raw| Flag::try_from(raw).ok())
    }

    /// wire 上のフラグ値そのもの（未知の値を含む）
    pub fn raw_flag(&self) -> Option<i32> {
        self.flag
    }

    /// ペイロードの参照（`message` が無ければ `None`）
    pub fn payload(&self) -> Option<&[u8]> {
        self.message.as_deref()
    }

    /// ペイロードを取り出す
    pub fn into_payload(self) -> Option<Vec<u8>> {
        self.message
    }

    /// 制御 Envelope か（flag フィールドが設定されているか）
    pub fn is_control(&self) -> bool {
        self.flag.is_some()
    }
}
