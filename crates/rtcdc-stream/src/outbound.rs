//! 送信パイプライン
//!
//! アプリケーションのチャンク列をデータ Envelope にして送る。
//! local-write-closed シグナルとチャンク列を競争させ、書き込み側が閉じたら
//! 残りのチャンクを待たずに終了する。制御フラグはここを通らない。
//!
//! [`StreamWriter`] は同期的に書き込みたい呼び出し側（JS など）向けのハンドル。
//! `close_write` は積んだチャンクを送り終えてから FIN を送る。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::{pin_mut, Stream, StreamExt};
use tracing::trace;

use crate::error::StreamError;
use crate::stream::WebRtcStream;

impl WebRtcStream {
    /// チャンク列を送信する
    ///
    /// channel-opened を待ってから送り始める。以下のいずれかで終了する:
    /// - チャンク列が終端した
    /// - 書き込み側が閉じた（`close_write` / `reset` / `close` / 相手の STOP_SENDING）
    ///
    /// 書き込み側は閉じない。終わったら呼び出し側が `close_write` すること。
    ///
    /// # エラー
    /// データチャンネルの send 失敗。ストリームの状態は変わらない。
    pub async fn sink<S, B>(&self, source: S) -> Result<(), StreamError>
    where
        S: Stream<Item = B>,
        B: AsRef<[u8]>,
    {
        self.opened().await;
        if self.is_write_closed() {
            return Ok(());
        }

        let mut write_closed = self.write_closed();
        pin_mut!(source);

        loop {
            let chunk = match future::select(&mut write_closed, source.next()).await {
                Either::Left(((), _)) => {
                    trace!(stream = %self.id(), "write closed, sink stopped");
                    break;
                }
                Either::Right((Some(chunk), _)) => chunk,
                Either::Right((None, _)) => break,
            };

            if self.is_write_closed() {
                break;
            }
            self.transmit_data(chunk.as_ref())?;
        }

        Ok(())
    }

    /// 書き込みハンドルと、それを送る送信パイプラインを作る
    ///
    /// 送信パイプライン（[`Outbound::run`]）はローカル executor で spawn すること。
    pub fn writer(&self) -> (StreamWriter, Outbound) {
        let (tx, rx) = mpsc::unbounded();
        let shared = Rc::new(WriterState::default());
        let writer = StreamWriter {
            stream: self.clone(),
            tx: RefCell::new(Some(tx)),
            shared: shared.clone(),
        };
        let outbound = Outbound {
            stream: self.clone(),
            chunks: rx,
            shared,
        };
        (writer, outbound)
    }
}

#[derive(Default)]
struct WriterState {
    /// 送信パイプラインが終わったら FIN を送る
    fin_after_flush: Cell<bool>,
    /// 送信パイプラインが終わった
    done: Cell<bool>,
}

/// キューに積んだチャンクを順に送る書き込みハンドル
pub struct StreamWriter {
    stream: WebRtcStream,
    tx: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    shared: Rc<WriterState>,
}

impl StreamWriter {
    /// チャンクを送信キューに積む
    ///
    /// 実際の送信は channel-opened の後。書き込み側が閉じていれば捨てられる。
    ///
    /// # エラー
    /// `close_write` 後、または送信パイプラインが終わった後は `StreamError::WriterClosed`。
    pub fn write(&self, chunk: Vec<u8>) -> Result<(), StreamError> {
        match self.tx.borrow().as_ref() {
            Some(tx) => tx
                .unbounded_send(chunk)
                .map_err(|_| StreamError::WriterClosed),
            None => Err(StreamError::WriterClosed),
        }
    }

    /// 積んだチャンクを送り終えてから書き込み側を閉じる（FIN）
    pub fn close_write(&self) {
        if self.tx.borrow_mut().take().is_none() {
            return;
        }
        if self.shared.done.get() {
            self.stream.close_write();
        } else {
            self.shared.fin_after_flush.set(true);
        }
    }
}

/// [`StreamWriter`] に積まれたチャンクを送る送信パイプライン
pub struct Outbound {
    stream: WebRtcStream,
    chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Rc<WriterState>,
}

impl Outbound {
    /// 送信ループ
    ///
    /// 書き込みハンドルが閉じられたか、書き込み側が閉じたら終わる。
    /// `StreamWriter::close_write` 済みなら最後に FIN を送る。
    ///
    /// # エラー
    /// データチャンネルの send 失敗（[`WebRtcStream::sink`] と同じ）。
    pub async fn run(self) -> Result<(), StreamError> {
        let Outbound {
            stream,
            chunks,
            shared,
        } = self;

        let result = stream.sink(chunks).await;
        shared.done.set(true);
        if shared.fin_after_flush.get() {
            stream.close_write();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use futures::channel::mpsc;
    use futures::executor::{block_on, LocalPool};
    use futures::stream;
    use futures::task::LocalSpawnExt;
    use rtcdc_proto::{encode_frame, Envelope, Flag, FrameDecoder};

    use super::*;
    use crate::channel::{ChannelError, ReadyState};
    use crate::config::StreamConfig;
    use crate::memory::MemoryChannel;
    use crate::stat::Direction;
    use crate::stream::StreamInit;

    type SinkResult = Rc<RefCell<Option<Result<(), StreamError>>>>;

    fn spawn_sink(
        pool: &LocalPool,
        stream: &WebRtcStream,
    ) -> (mpsc::UnboundedSender<Vec<u8>>, SinkResult) {
        let (tx, rx) = mpsc::unbounded::<Vec<u8>>();
        let result: SinkResult = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let stream = stream.clone();
        pool.spawner()
            .spawn_local(async move {
                *slot.borrow_mut() = Some(stream.sink(rx).await);
            })
            .unwrap();
        (tx, result)
    }

    fn data(payload: &[u8]) -> Vec<u8> {
        encode_frame(&Envelope::data(payload.to_vec()))
    }

    fn control(flag: Flag) -> Vec<u8> {
        encode_frame(&Envelope::control(flag))
    }

    #[test]
    fn test_sink_sends_framed_chunks() {
        let channel = MemoryChannel::new("sink", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));

        let chunks = stream::iter(vec![b"ab".to_vec(), b"cd".to_vec()]);
        block_on(stream.sink(chunks)).unwrap();

        assert_eq!(channel.sent(), vec![data(b"ab"), data(b"cd")]);
        assert!(!stream.is_write_closed(), "sink の終了だけでは書き込み側は閉じない");
    }

    #[test]
    fn test_sink_waits_for_open() {
        let mut pool = LocalPool::new();
        let (local, remote) = MemoryChannel::pair("sink-open");
        let (stream, _inbound) = WebRtcStream::new(local.clone(), StreamInit::new(Direction::Outbound));
        let (tx, result) = spawn_sink(&pool, &stream);

        tx.unbounded_send(b"early".to_vec()).unwrap();
        pool.run_until_stalled();
        assert!(local.sent().is_empty(), "open 前は送らない");

        remote.open();
        pool.run_until_stalled();
        assert_eq!(local.sent(), vec![data(b"early")]);

        drop(tx);
        pool.run_until_stalled();
        assert!(matches!(*result.borrow(), Some(Ok(()))));
    }

    #[test]
    fn test_close_write_stops_pending_chunks() {
        let mut pool = LocalPool::new();
        let channel = MemoryChannel::new("sink-close", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));
        let (tx, result) = spawn_sink(&pool, &stream);

        tx.unbounded_send(b"ab".to_vec()).unwrap();
        pool.run_until_stalled();

        stream.close_write();
        tx.unbounded_send(b"cd".to_vec()).unwrap();
        pool.run_until_stalled();

        assert_eq!(channel.sent(), vec![data(b"ab"), control(Flag::Fin)]);
        assert!(matches!(*result.borrow(), Some(Ok(()))), "チャンク列が残っていても終了する");
    }

    #[test]
    fn test_reset_mid_write() {
        let mut pool = LocalPool::new();
        let channel = MemoryChannel::new("sink-reset", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));
        let (tx, result) = spawn_sink(&pool, &stream);

        stream.close_read();
        tx.unbounded_send(b"ab".to_vec()).unwrap();
        pool.run_until_stalled();

        stream.reset();
        tx.unbounded_send(b"cd".to_vec()).unwrap();
        pool.run_until_stalled();

        assert_eq!(
            channel.sent(),
            vec![control(Flag::StopSending), data(b"ab"), control(Flag::Reset)]
        );
        assert!(stream.is_write_closed());
        assert!(stream.is_closed(), "読み込み側が閉じていたので close まで進む");
        assert!(matches!(*result.borrow(), Some(Ok(()))));
    }

    #[test]
    fn test_sink_on_closed_stream_returns_immediately() {
        let channel = MemoryChannel::new("sink-closed", ReadyState::Closed);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));

        block_on(stream.sink(stream::iter(vec![b"x".to_vec()]))).unwrap();
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn test_large_chunk_is_split() {
        let channel = MemoryChannel::new("sink-split", ReadyState::Open);
        let config = StreamConfig {
            max_message_size: 32,
            ..StreamConfig::default()
        };
        let max_payload = config.max_payload_len();
        let (stream, _inbound) = WebRtcStream::new(
            channel.clone(),
            StreamInit::new(Direction::Outbound).with_config(config),
        );

        let payload: Vec<u8> = (0u8..40).collect();
        block_on(stream.sink(stream::iter(vec![payload.clone()]))).unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), payload.len().div_ceil(max_payload));

        // 相手側のデコーダ（同じ上限）で元に戻る
        let mut decoder = FrameDecoder::new(32);
        let mut joined = Vec::new();
        for frame in &sent {
            assert!(frame.len() <= 32);
            decoder.push(frame);
            while let Some(env) = decoder.next_frame().unwrap() {
                joined.extend(env.into_payload().unwrap());
            }
        }
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_send_error_does_not_change_state() {
        let channel = MemoryChannel::new("sink-err", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));
        // ストリームは Open のまま、チャンネルだけ send できなくする
        channel.set_ready_state(ReadyState::Closing);

        let result = block_on(stream.sink(stream::iter(vec![b"x".to_vec()])));
        assert!(matches!(
            result,
            Err(StreamError::Channel(ChannelError::NotOpen))
        ));
        assert!(!stream.is_write_closed());
        assert!(!stream.is_closed());
    }

    fn spawn_writer(pool: &LocalPool, stream: &WebRtcStream) -> (StreamWriter, SinkResult) {
        let (writer, outbound) = stream.writer();
        let result: SinkResult = Rc::new(RefCell::new(None));
        let slot = result.clone();
        pool.spawner()
            .spawn_local(async move {
                *slot.borrow_mut() = Some(outbound.run().await);
            })
            .unwrap();
        (writer, result)
    }

    #[test]
    fn test_writer_flushes_before_fin() {
        let mut pool = LocalPool::new();
        let channel = MemoryChannel::new("writer", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));
        let (writer, result) = spawn_writer(&pool, &stream);

        // 送信ループが一度も動かないうちに閉じる
        writer.write(b"hello".to_vec()).unwrap();
        writer.close_write();
        assert!(!stream.is_write_closed(), "FIN は積んだ分を送った後");
        assert!(matches!(
            writer.write(b"late".to_vec()),
            Err(StreamError::WriterClosed)
        ));

        pool.run_until_stalled();
        assert_eq!(channel.sent(), vec![data(b"hello"), control(Flag::Fin)]);
        assert!(stream.is_write_closed());
        assert!(matches!(*result.borrow(), Some(Ok(()))));
    }

    #[test]
    fn test_writer_close_before_open() {
        let mut pool = LocalPool::new();
        let (local, remote) = MemoryChannel::pair("writer-open");
        let (stream, _inbound) = WebRtcStream::new(local.clone(), StreamInit::new(Direction::Outbound));
        let (writer, _result) = spawn_writer(&pool, &stream);

        writer.write(b"early".to_vec()).unwrap();
        writer.close_write();
        pool.run_until_stalled();
        assert!(local.sent().is_empty());

        remote.open();
        pool.run_until_stalled();
        assert_eq!(local.sent(), vec![data(b"early"), control(Flag::Fin)]);
    }

    #[test]
    fn test_writer_close_after_stream_write_closed() {
        let mut pool = LocalPool::new();
        let channel = MemoryChannel::new("writer-reset", ReadyState::Open);
        let (stream, _inbound) = WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Outbound));
        let (writer, _result) = spawn_writer(&pool, &stream);

        stream.reset();
        pool.run_until_stalled();
        writer.close_write();

        // reset で書き込み側は閉じているので FIN は送らない
        assert_eq!(channel.sent(), vec![control(Flag::Reset)]);
    }
}
