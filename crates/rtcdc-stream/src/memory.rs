//! プロセス内ループバックのデータチャンネル
//!
//! テストとデモ用。`pair` で作った 2 本は互いに send した内容を
//! 相手の message イベントとして同期的に届ける。片方を close すると相手側にも
//! close イベントが届く（RTCDataChannel と同じ）。

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::channel::{ChannelError, ChannelEvents, DataChannel, ReadyState};

struct MemoryInner {
    label: String,
    state: Cell<ReadyState>,
    events: RefCell<Option<ChannelEvents>>,
    peer: RefCell<Weak<MemoryInner>>,
    /// 送信したメッセージの記録
    sent: RefCell<Vec<Vec<u8>>>,
}

/// メモリ上のデータチャンネル
#[derive(Clone)]
pub struct MemoryChannel {
    inner: Rc<MemoryInner>,
}

impl MemoryChannel {
    /// 相手のいないチャンネルを生成する（送信内容は記録されるだけ）
    pub fn new(label: &str, state: ReadyState) -> Self {
        MemoryChannel {
            inner: Rc::new(MemoryInner {
                label: label.to_owned(),
                state: Cell::new(state),
                events: RefCell::new(None),
                peer: RefCell::new(Weak::new()),
                sent: RefCell::new(Vec::new()),
            }),
        }
    }

    /// 接続中（connecting）の 2 本組を生成する
    pub fn pair(label: &str) -> (Self, Self) {
        let a = MemoryChannel::new(label, ReadyState::Connecting);
        let b = MemoryChannel::new(label, ReadyState::Connecting);
        *a.inner.peer.borrow_mut() = Rc::downgrade(&b.inner);
        *b.inner.peer.borrow_mut() = Rc::downgrade(&a.inner);
        (a, b)
    }

    /// チャンネルを開く（相手がいれば相手も開く）
    pub fn open(&self) {
        self.open_local();
        if let Some(peer) = self.peer() {
            peer.open_local();
        }
    }

    /// 相手から届いたメッセージとして `data` を配送する
    pub fn inject(&self, data: &[u8]) {
        let events = self.inner.events.borrow().clone();
        if let Some(events) = events {
            events.on_message(data);
        }
    }

    /// error イベントを発生させる
    pub fn fail(&self, err: ChannelError) {
        let events = self.inner.events.borrow().clone();
        if let Some(events) = events {
            events.on_error(err);
        }
    }

    /// トランスポート側で閉じられたことにする（close イベントを発生させる）
    pub fn remote_close(&self) {
        if self.inner.state.get() == ReadyState::Closed {
            return;
        }
        self.inner.state.set(ReadyState::Closed);
        let events = self.inner.events.borrow_mut().take();
        if let Some(events) = events {
            events.on_close();
        }
    }

    /// これまでに send したメッセージ
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.borrow().clone()
    }

    pub fn state(&self) -> ReadyState {
        self.inner.state.get()
    }

    /// イベントを発生させずに状態だけ変える
    pub fn set_ready_state(&self, state: ReadyState) {
        self.inner.state.set(state);
    }

    /// ストリームがイベントを登録しているか
    pub fn has_listener(&self) -> bool {
        self.inner.events.borrow().is_some()
    }

    fn open_local(&self) {
        if self.inner.state.get() != ReadyState::Connecting {
            return;
        }
        self.inner.state.set(ReadyState::Open);
        let events = self.inner.events.borrow().clone();
        if let Some(events) = events {
            events.on_open();
        }
    }

    fn peer(&self) -> Option<MemoryChannel> {
        self.inner
            .peer
            .borrow()
            .upgrade()
            .map(|inner| MemoryChannel { inner })
    }
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> String {
        self.inner.label.clone()
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.state.get()
    }

    fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.inner.state.get() != ReadyState::Open {
            return Err(ChannelError::NotOpen);
        }
        self.inner.sent.borrow_mut().push(data.to_vec());
        if let Some(peer) = self.peer() {
            peer.inject(data);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ChannelError> {
        // 登録済みのイベントは常に手放す（ストリームとの循環参照を切る）
        let events = self.inner.events.borrow_mut().take();
        drop(events);

        if self.inner.state.get() == ReadyState::Closed {
            return Ok(());
        }
        self.inner.state.set(ReadyState::Closed);
        if let Some(peer) = self.peer() {
            peer.remote_close();
        }
        Ok(())
    }

    fn register(&self, events: ChannelEvents) {
        *self.inner.events.borrow_mut() = Some(events);
    }
}
