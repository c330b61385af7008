//! ストリーム本体（公開ファサード）
//!
//! チャンネルアダプタ・状態機械・受信/送信パイプライン・シグナルをまとめ、
//! 上位の多重化レイヤーに見せるストリームの契約を提供する。

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures::channel::mpsc;
use futures::future::FusedFuture;
use rtcdc_proto::{encode_frame, Envelope, Flag, FrameDecoder};
use tracing::{debug, trace, warn};

use crate::channel::{ChannelAdapter, ChannelEvents, DataChannel, ReadyState};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::inbound::{Inbound, StreamSource};
use crate::signal::Signal;
use crate::stat::{Direction, StreamStat};
use crate::state::{HalfClose, Lifecycle, StreamState};
use crate::time::now_ms;

/// アプリケーション定義のメタデータ（プロトコル上の意味は無い）
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// close 完了時に一度だけ呼ばれるコールバック
pub type CloseCallback = Box<dyn FnOnce(&WebRtcStream)>;

/// ストリーム生成時のパラメータ
pub struct StreamInit {
    direction: Direction,
    metadata: Metadata,
    stat: Option<StreamStat>,
    config: StreamConfig,
    close_cb: Option<CloseCallback>,
}

impl StreamInit {
    pub fn new(direction: Direction) -> Self {
        StreamInit {
            direction,
            metadata: Metadata::new(),
            stat: None,
            config: StreamConfig::default(),
            close_cb: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// 初期統計を指定する（方向は `stat.direction` が優先される）
    pub fn with_stat(mut self, stat: StreamStat) -> Self {
        self.stat = Some(stat);
        self
    }

    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }

    /// close 完了時のコールバック（所有者のレジストリから外す用途）
    pub fn on_close(mut self, cb: impl FnOnce(&WebRtcStream) + 'static) -> Self {
        self.close_cb = Some(Box::new(cb));
        self
    }
}

struct StreamInner {
    id: String,
    config: StreamConfig,
    channel: ChannelAdapter,
    lifecycle: RefCell<Lifecycle>,
    metadata: RefCell<Metadata>,
    /// channel-opened シグナル
    opened: Signal,
    /// local-write-closed シグナル
    write_closed: Signal,
    /// アプリケーションへ渡すペイロードのキュー（読み込み側が閉じたら None）
    payloads: RefCell<Option<mpsc::UnboundedSender<Result<Vec<u8>, StreamError>>>>,
    /// まだ取り出されていない読み出し側
    source: RefCell<Option<StreamSource>>,
    close_cb: RefCell<Option<CloseCallback>>,
}

/// データチャンネル 1 本の上に載る双方向バイトストリーム
///
/// ## 使い方
///
/// ```ignore
/// let (stream, inbound) = WebRtcStream::new(channel, StreamInit::new(Direction::Outbound));
/// spawn_local(inbound.run());          // 受信パイプライン
/// let source = stream.source().unwrap(); // 受信ペイロード
/// stream.sink(outgoing).await?;        // 送信パイプライン
/// stream.close_write();                // FIN
/// ```
///
/// ## スレッド安全性
///
/// `Rc` / `RefCell` ベースで `!Send + !Sync`。
/// チャンネルのコールバックもパイプラインも同じスレッドで動かす前提。
#[derive(Clone)]
pub struct WebRtcStream {
    inner: Rc<StreamInner>,
}

impl WebRtcStream {
    /// チャンネルを包んでストリームを生成する
    ///
    /// # 戻り値
    /// ストリームと受信パイプライン。受信パイプライン（[`Inbound::run`]）は
    /// 呼び出し側のローカル executor で spawn すること。
    /// 制御フラグの処理も受信パイプラインが行う。
    ///
    /// チャンネルがすでに closing / closed の場合はストリームを即座に閉じる。
    /// close は channel-opened も発火させるので、open を待つ送信側は止まらない。
    pub fn new(channel: impl DataChannel + 'static, init: StreamInit) -> (WebRtcStream, Inbound) {
        let (adapter, raw) = ChannelAdapter::new(Box::new(channel));
        let (payload_tx, payload_rx) = mpsc::unbounded();
        let stat = init.stat.unwrap_or_else(|| StreamStat::new(init.direction));
        let ready_state = adapter.ready_state();

        let stream = WebRtcStream {
            inner: Rc::new(StreamInner {
                id: adapter.label(),
                channel: adapter,
                lifecycle: RefCell::new(Lifecycle::new(stat)),
                metadata: RefCell::new(init.metadata),
                opened: Signal::new(),
                write_closed: Signal::new(),
                payloads: RefCell::new(Some(payload_tx)),
                source: RefCell::new(Some(StreamSource::new(payload_rx))),
                close_cb: RefCell::new(init.close_cb),
                config: init.config,
            }),
        };

        let decoder = FrameDecoder::new(stream.inner.config.max_frame_len);
        let inbound = Inbound::new(stream.clone(), raw, decoder);

        debug!(stream = %stream.id(), ?ready_state, "stream created");

        match ready_state {
            ReadyState::Connecting => {
                stream.inner.channel.register(ChannelEvents::new(stream.clone()));
            }
            ReadyState::Open => {
                stream.inner.channel.register(ChannelEvents::new(stream.clone()));
                stream.handle_open();
            }
            ReadyState::Closing | ReadyState::Closed => {
                stream.close();
            }
        }

        (stream, inbound)
    }

    /// ストリーム ID（チャンネルのラベル）
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.lifecycle.borrow().stat().direction
    }

    pub fn stat(&self) -> StreamStat {
        self.inner.lifecycle.borrow().stat().clone()
    }

    pub fn state(&self) -> StreamState {
        self.inner.lifecycle.borrow().state()
    }

    pub fn is_read_closed(&self) -> bool {
        self.inner.lifecycle.borrow().is_read_closed()
    }

    pub fn is_write_closed(&self) -> bool {
        self.inner.lifecycle.borrow().is_write_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.borrow().is_closed()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    pub fn metadata(&self) -> Metadata {
        self.inner.metadata.borrow().clone()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.metadata.borrow_mut().insert(key.into(), value);
    }

    /// 受信ペイロードの読み出し側を取り出す（一度だけ `Some`）
    pub fn source(&self) -> Option<StreamSource> {
        self.inner.source.borrow_mut().take()
    }

    /// channel-opened シグナル
    pub fn opened(&self) -> impl FusedFuture<Output = ()> + Unpin + 'static {
        self.inner.opened.wait()
    }

    /// local-write-closed シグナル
    pub fn write_closed(&self) -> impl FusedFuture<Output = ()> + Unpin + 'static {
        self.inner.write_closed.wait()
    }

    /// 読み込み側を閉じる
    ///
    /// 相手に STOP_SENDING を送り、以降に届いたデータは捨てる。
    /// 書き込み側も閉じていれば close に進む。
    pub fn close_read(&self) {
        let transition = self.inner.lifecycle.borrow_mut().close_read();
        if transition == HalfClose::Ignored {
            return;
        }

        self.send_flag(Flag::StopSending);
        self.end_source();
        trace!(stream = %self.id(), "read half closed");

        if transition == HalfClose::BothClosed {
            self.close();
        }
    }

    /// 書き込み側を閉じる
    ///
    /// 相手に FIN を送り、送信パイプラインを止める。
    /// 読み込み側も閉じていれば close に進む。
    pub fn close_write(&self) {
        self.close_write_inner(true);
    }

    /// ローカルのエラーで中断する
    ///
    /// 両側をすぐに閉じる。エラーは相手には通知しない。
    pub fn abort(&self, err: StreamError) {
        if self.is_closed() {
            return;
        }
        warn!(stream = %self.id(), %err, "stream aborted");
        self.close();
    }

    /// 書き込み側をリセットする
    ///
    /// 相手に RESET を送り、統計を初期化して書き込み側を閉じる。
    /// 読み込み側はそのまま（すでに閉じていれば close に進む）。
    pub fn reset(&self) {
        let transition = self.inner.lifecycle.borrow_mut().reset();
        if transition == HalfClose::Ignored {
            return;
        }

        self.send_flag(Flag::Reset);
        self.inner.write_closed.fire();
        debug!(stream = %self.id(), "stream reset");

        if transition == HalfClose::BothClosed {
            self.close();
        }
    }

    /// ストリームを閉じる（終端状態）
    ///
    /// 二回目以降は何もしない。チャンネルを解放し、close コールバックを呼ぶ。
    /// close より前に届いていたデータは読み出し側に残る。
    pub fn close(&self) {
        if !self.inner.lifecycle.borrow_mut().close(now_ms()) {
            return;
        }
        debug!(stream = %self.id(), "stream closed");

        // open を待っている送信パイプラインも起こす
        self.inner.opened.fire();
        self.inner.write_closed.fire();
        self.inner.channel.shutdown();

        // close 前に届いたチャンクが残っていれば、受信パイプラインが読み切ってから終端させる
        if self.inner.channel.has_queued() {
            trace!(stream = %self.id(), "draining queued messages before ending source");
        } else {
            self.end_source();
        }

        let cb = self.inner.close_cb.borrow_mut().take();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    pub(crate) fn close_write_inner(&self, notify_peer: bool) {
        let transition = self.inner.lifecycle.borrow_mut().close_write();
        if transition == HalfClose::Ignored {
            return;
        }

        if notify_peer {
            self.send_flag(Flag::Fin);
        }
        self.inner.write_closed.fire();
        trace!(stream = %self.id(), notify_peer, "write half closed");

        if transition == HalfClose::BothClosed {
            self.close();
        }
    }

    pub(crate) fn handle_open(&self) {
        self.inner.lifecycle.borrow_mut().mark_opened(now_ms());
        self.inner.opened.fire();
        trace!(stream = %self.id(), "data channel opened");
    }

    pub(crate) fn handle_message(&self, data: &[u8]) {
        if data.is_empty() {
            trace!(stream = %self.id(), "discarding empty message");
            return;
        }
        if !self.inner.channel.enqueue(data) {
            trace!(stream = %self.id(), len = data.len(), "message after inbound shutdown dropped");
        }
    }

    /// アプリケーションへペイロード（またはデコードエラー）を渡す
    ///
    /// 読み出し側がすでに終端していれば捨てる（`close_read` 以降に届いた分）。
    pub(crate) fn deliver(&self, item: Result<Vec<u8>, StreamError>) {
        match self.inner.payloads.borrow().as_ref() {
            // 読み出し側が破棄されていても気にしない
            Some(tx) => {
                let _ = tx.unbounded_send(item);
            }
            None => trace!(stream = %self.id(), "read closed, dropping payload"),
        }
    }

    /// 受信パイプラインがチャンクを 1 つ処理し終えた
    pub(crate) fn chunk_consumed(&self) {
        self.inner.channel.consumed();
    }

    pub(crate) fn transmit_data(&self, payload: &[u8]) -> Result<(), StreamError> {
        for piece in payload.chunks(self.inner.config.max_payload_len()) {
            let frame = encode_frame(&Envelope::data(piece.to_vec()));
            self.inner.channel.transmit(&frame)?;
        }
        Ok(())
    }

    /// 制御フラグを送る。失敗しても状態遷移は止めない。
    fn send_flag(&self, flag: Flag) {
        let frame = encode_frame(&Envelope::control(flag));
        match self.inner.channel.transmit(&frame) {
            Ok(()) => trace!(stream = %self.id(), ?flag, "control flag sent"),
            Err(err) => warn!(stream = %self.id(), ?flag, %err, "failed to send control flag"),
        }
    }

    /// 読み出し側を終端させる（キュー済みのペイロードは読める）
    pub(crate) fn end_source(&self) {
        self.inner.payloads.borrow_mut().take();
    }
}

impl core::fmt::Debug for WebRtcStream {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebRtcStream")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}
