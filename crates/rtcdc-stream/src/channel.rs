//! 下位データチャンネルとのアダプタ
//!
//! ## 責任
//! - [`DataChannel`]: 下位チャンネル（RTCDataChannel など）に求める最小限の操作
//! - [`ChannelEvents`]: チャンネルの push 型イベント（open / message / close / error）を
//!   ストリームへ届ける受け口
//! - [`ChannelAdapter`]: チャンネルを独占所有し、受信チャンクを FIFO キューに積んで
//!   受信パイプラインが pull で読めるようにする。送信は `transmit` のみ。

use std::cell::{Cell, RefCell};

use futures::channel::mpsc;
use tracing::{trace, warn};

use crate::error::StreamError;
use crate::stream::WebRtcStream;

/// チャンネルの準備状態（生成時に一度だけ参照する）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// データチャンネル操作のエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// 開いていないチャンネルへの送信
    #[error("Data channel is not open")]
    NotOpen,
    /// send / close が失敗した
    #[error("Data channel send failed: {0}")]
    Send(String),
    /// トランスポートから error イベントが来た
    #[error("Data channel error: {0}")]
    Transport(String),
}

/// ストリームが下位チャンネルに要求する操作
///
/// 実装側は `register` で渡された [`ChannelEvents`] に各イベントを通知する。
/// `close` の後は登録された `ChannelEvents` を手放すこと（ストリームとの循環参照が切れる）。
pub trait DataChannel {
    /// チャンネルのラベル（ストリーム ID になる）
    fn label(&self) -> String;

    /// 現在の準備状態
    fn ready_state(&self) -> ReadyState;

    /// メッセージを送る。ブロックせず、到達確認もしない。
    fn send(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// チャンネルを閉じる
    fn close(&self) -> Result<(), ChannelError>;

    /// イベントの受け口を登録する
    fn register(&self, events: ChannelEvents);
}

/// チャンネルイベントの受け口
///
/// チャンネル実装はイベント発生時に対応するメソッドを呼ぶ。
/// 同じスレッドから呼ぶこと（`!Send`）。
#[derive(Clone)]
pub struct ChannelEvents {
    stream: WebRtcStream,
}

impl ChannelEvents {
    pub(crate) fn new(stream: WebRtcStream) -> Self {
        ChannelEvents { stream }
    }

    /// チャンネルが開いた
    pub fn on_open(&self) {
        self.stream.handle_open();
    }

    /// メッセージを受信した
    pub fn on_message(&self, data: &[u8]) {
        self.stream.handle_message(data);
    }

    /// チャンネルが閉じた（相手またはトランスポートによる）
    ///
    /// 半クローズではなくストリーム全体を閉じる。
    pub fn on_close(&self) {
        self.stream.close();
    }

    /// チャンネルでエラーが起きた
    pub fn on_error(&self, err: ChannelError) {
        self.stream.abort(StreamError::Channel(err));
    }
}

/// チャンネルを独占所有するアダプタ
pub(crate) struct ChannelAdapter {
    channel: Box<dyn DataChannel>,
    /// 受信チャンクのキュー（閉じたら None）
    inbound: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// キューに積まれ、受信パイプラインがまだ処理していないチャンク数
    queued: Cell<usize>,
}

impl ChannelAdapter {
    /// アダプタと、受信チャンクを読み出す側を生成する
    pub(crate) fn new(channel: Box<dyn DataChannel>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded();
        let adapter = ChannelAdapter {
            channel,
            inbound: RefCell::new(Some(tx)),
            queued: Cell::new(0),
        };
        (adapter, rx)
    }

    pub(crate) fn label(&self) -> String {
        self.channel.label()
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        self.channel.ready_state()
    }

    pub(crate) fn register(&self, events: ChannelEvents) {
        self.channel.register(events);
    }

    /// 受信チャンクをキューに積む。積めなかった場合は `false`。
    pub(crate) fn enqueue(&self, chunk: &[u8]) -> bool {
        let queued = match self.inbound.borrow().as_ref() {
            Some(tx) => tx.unbounded_send(chunk.to_vec()).is_ok(),
            None => false,
        };
        if queued {
            self.queued.set(self.queued.get() + 1);
        }
        queued
    }

    /// 受信パイプラインがチャンクを 1 つ処理し終えた
    pub(crate) fn consumed(&self) {
        self.queued.set(self.queued.get().saturating_sub(1));
    }

    /// 未処理のチャンクが残っているか
    pub(crate) fn has_queued(&self) -> bool {
        self.queued.get() > 0
    }

    /// 送信（送信パイプラインと制御フラグ送信のみが使う）
    pub(crate) fn transmit(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        self.channel.send(bytes)
    }

    /// 受信キューを終端させ、チャンネルを閉じる
    ///
    /// すでに積まれたチャンクは受信パイプラインが読み切る。close の失敗はログに残すだけ。
    pub(crate) fn shutdown(&self) {
        self.inbound.borrow_mut().take();
        match self.channel.close() {
            Ok(()) => trace!(label = %self.channel.label(), "data channel closed"),
            Err(err) => warn!(label = %self.channel.label(), %err, "data channel close failed"),
        }
    }
}
