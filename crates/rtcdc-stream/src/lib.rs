//! # rtcdc-stream
//!
//! メッセージ指向のデータチャンネル（RTCDataChannel など）1 本の上に、
//! 半クローズ可能な双方向バイトストリームを載せるプロトコル層。
//!
//! ## 構成
//!
//! ```text
//! WebRtcStream (stream)
//!   ├── ChannelAdapter (channel)  - チャンネルを独占所有、イベント → 受信キュー
//!   ├── Lifecycle      (state)    - open / 半クローズ / closed の状態機械
//!   ├── Inbound        (inbound)  - フレーム復元 → 制御フラグ処理 → ペイロード
//!   ├── sink           (outbound) - チャンク → データ Envelope → send
//!   │   └── StreamWriter            - 同期書き込み用のキュー（FIN は送り切ってから）
//!   └── Signal × 2     (signal)   - channel-opened / local-write-closed
//! ```
//!
//! ## 制御フラグ
//!
//! | 操作 / 受信 | 送るフラグ | 状態遷移 |
//! |---|---|---|
//! | `close_read()` | STOP_SENDING | 読み込み側を閉じる |
//! | `close_write()` | FIN | 書き込み側を閉じる |
//! | `reset()` | RESET | 統計を初期化し書き込み側を閉じる |
//! | `abort(err)` / `close()` | なし | 両側を閉じてチャンネルを解放 |
//! | 受信 STOP_SENDING | なし | 書き込み側を閉じる |
//! | 受信 FIN / RESET | STOP_SENDING | 読み込み側を閉じる |
//!
//! 両側が閉じると自動的に `close()` へ進む。
//!
//! ## スレッドモデル
//!
//! シングルスレッドの協調スケジューリング前提（`Rc` / `RefCell`）。
//! 受信パイプラインは [`WebRtcStream::new`] が返す [`Inbound`] を
//! ローカル executor で spawn して動かす。

pub mod channel;
pub mod config;
pub mod error;
pub mod inbound;
pub mod memory;
mod outbound;
pub mod signal;
pub mod stat;
pub mod state;
pub mod stream;
pub mod time;

pub use channel::{ChannelError, ChannelEvents, DataChannel, ReadyState};
pub use config::StreamConfig;
pub use error::StreamError;
pub use inbound::{Inbound, StreamSource};
pub use memory::MemoryChannel;
pub use outbound::{Outbound, StreamWriter};
pub use signal::Signal;
pub use stat::{Direction, StreamStat, Timeline};
pub use state::StreamState;
pub use stream::{CloseCallback, Metadata, StreamInit, WebRtcStream};

pub use rtcdc_proto::{Envelope, Flag};
