//! ストリームの開閉状態機械
//!
//! 副作用（フラグ送信、シグナル発火、チャンネル解放）は持たない純粋な状態だけを扱う。
//! 遷移の結果を見て [`WebRtcStream`](crate::WebRtcStream) が副作用を実行する。
//!
//! ```text
//! Unopened → Open → ReadClosed  ─┐
//!              └──→ WriteClosed ─┴→ Closed
//!
//! close() / abort() / チャンネル切断はどの状態からでも Closed へ
//! ```

use crate::stat::StreamStat;

/// 外から観測できる状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// チャンネルがまだ開いていない
    Unopened,
    Open,
    /// 読み込み側のみ閉じている
    ReadClosed,
    /// 書き込み側のみ閉じている
    WriteClosed,
    /// 終端状態。以降の操作はすべて no-op
    Closed,
}

/// 半クローズ操作の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClose {
    /// すでに閉じていたので何もしていない
    Ignored,
    /// 指定した側を閉じた。もう片方はまだ開いている
    HalfClosed,
    /// 指定した側を閉じ、両側とも閉じた。呼び出し側は close を実行すること
    BothClosed,
}

/// 開閉状態と統計
#[derive(Debug, Clone)]
pub struct Lifecycle {
    opened: bool,
    read_closed: bool,
    write_closed: bool,
    closed: bool,
    stat: StreamStat,
}

impl Lifecycle {
    pub fn new(stat: StreamStat) -> Self {
        Lifecycle {
            opened: false,
            read_closed: false,
            write_closed: false,
            closed: false,
            stat,
        }
    }

    pub fn state(&self) -> StreamState {
        if self.closed {
            StreamState::Closed
        } else if self.read_closed {
            StreamState::ReadClosed
        } else if self.write_closed {
            StreamState::WriteClosed
        } else if !self.opened {
            StreamState::Unopened
        } else {
            StreamState::Open
        }
    }

    pub fn stat(&self) -> &StreamStat {
        &self.stat
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_write_closed(&self) -> bool {
        self.write_closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// チャンネルが開いたことを記録する。初回のみ `true`。
    ///
    /// `timeline.open` は未設定の場合のみ埋める。
    pub fn mark_opened(&mut self, now_ms: u64) -> bool {
        if self.opened {
            return false;
        }
        self.opened = true;
        if !self.closed && self.stat.timeline.open.is_none() {
            self.stat.timeline.open = Some(now_ms);
        }
        true
    }

    pub fn close_read(&mut self) -> HalfClose {
        if self.closed || self.read_closed {
            return HalfClose::Ignored;
        }
        self.read_closed = true;
        self.half_close_result()
    }

    pub fn close_write(&mut self) -> HalfClose {
        if self.closed || self.write_closed {
            return HalfClose::Ignored;
        }
        self.write_closed = true;
        self.half_close_result()
    }

    /// 書き込み側の強制リセット
    ///
    /// 統計を同じ方向の未オープン状態に戻し、書き込み側を閉じる。
    /// 読み込み側には触れない。
    pub fn reset(&mut self) -> HalfClose {
        if self.closed || self.write_closed {
            return HalfClose::Ignored;
        }
        self.stat = StreamStat::new(self.stat.direction);
        self.write_closed = true;
        self.half_close_result()
    }

    /// 終端状態へ遷移する。初回のみ `true`。
    ///
    /// 両側のフラグも強制的に閉じる。`timeline.close` は `timeline.open` より前にならない。
    pub fn close(&mut self, now_ms: u64) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.read_closed = true;
        self.write_closed = true;

        if self.stat.timeline.close.is_none() {
            let opened_at = self.stat.timeline.open.unwrap_or(0);
            self.stat.timeline.close = Some(now_ms.max(opened_at));
        }
        true
    }

    fn half_close_result(&self) -> HalfClose {
        if self.read_closed && self.write_closed {
            HalfClose::BothClosed
        } else {
            HalfClose::HalfClosed
        }
    }
}
