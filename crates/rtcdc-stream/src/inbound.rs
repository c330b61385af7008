//! 受信パイプライン
//!
//! チャンネルから届いた生チャンクを [`FrameDecoder`] でフレームに戻し、
//! 制御フラグを解釈してからペイロードをアプリケーションへ渡す。
//! Envelope は wire 上で完成した順に処理する。

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use rtcdc_proto::{Envelope, Flag, FrameDecoder, ProtoError};
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::stream::WebRtcStream;

/// 受信パイプライン
///
/// [`WebRtcStream::new`] が返す。ローカル executor で [`run`](Inbound::run) を spawn すること。
/// ストリームが閉じる（チャンネルの受信キューが終端する）と、積まれていたチャンクを
/// 読み切ってから完了する。
pub struct Inbound {
    stream: WebRtcStream,
    raw: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: FrameDecoder,
}

impl Inbound {
    pub(crate) fn new(
        stream: WebRtcStream,
        raw: mpsc::UnboundedReceiver<Vec<u8>>,
        decoder: FrameDecoder,
    ) -> Self {
        Inbound {
            stream,
            raw,
            decoder,
        }
    }

    /// 受信ループ
    ///
    /// # エラー
    /// デコードエラー（不正な長さプレフィックス、壊れた Envelope、終端での途中フレーム）。
    /// エラーはアプリケーションの読み出し側にも一度だけ渡され、読み込み側は閉じられる。
    pub async fn run(mut self) -> Result<(), StreamError> {
        while let Some(chunk) = self.raw.next().await {
            self.decoder.push(&chunk);
            let decoded = self.drain_frames();
            self.stream.chunk_consumed();
            if let Err(err) = decoded {
                return Err(self.fail(err));
            }
        }

        if let Err(err) = self.decoder.finish() {
            return Err(self.fail(err));
        }
        // close 前に届いていた分まで渡し終えた
        self.stream.end_source();
        trace!(stream = %self.stream.id(), "inbound finished");
        Ok(())
    }

    /// バッファ中の完成したフレームをすべて処理する
    fn drain_frames(&mut self) -> Result<(), ProtoError> {
        while let Some(envelope) = self.decoder.next_frame()? {
            self.dispatch(envelope);
        }
        Ok(())
    }

    fn dispatch(&self, envelope: Envelope) {
        let stream = &self.stream;
        match envelope.control_flag() {
            Some(Flag::StopSending) => {
                // 相手はもう読まない。FIN は返さない
                trace!(stream = %stream.id(), "received STOP_SENDING");
                stream.close_write_inner(false);
            }
            Some(Flag::Fin) => {
                trace!(stream = %stream.id(), "received FIN");
                stream.close_read();
                // close 済みで読み切り中でも、FIN より後のデータは渡さない
                stream.end_source();
            }
            Some(Flag::Reset) => {
                // FIN と同じ扱い。すでに読み出し側に渡した分は残す
                trace!(stream = %stream.id(), "received RESET");
                stream.close_read();
                stream.end_source();
            }
            None if envelope.is_control() => {
                debug!(stream = %stream.id(), flag = ?envelope.raw_flag(), "ignoring unknown flag");
            }
            None => match envelope.into_payload() {
                Some(payload) if !payload.is_empty() => stream.deliver(Ok(payload)),
                _ => {}
            },
        }
    }

    fn fail(&self, err: ProtoError) -> StreamError {
        warn!(stream = %self.stream.id(), %err, "inbound decode failed");
        self.stream.deliver(Err(StreamError::Proto(err.clone())));
        self.stream.close_read();
        self.stream.end_source();
        StreamError::Proto(err)
    }
}

/// アプリケーションが読む受信ペイロード列
///
/// 読み込み側が閉じると（キュー済みの分を返した後）終端する。
/// デコードエラーは `Err` として一度だけ現れる。
pub struct StreamSource {
    rx: mpsc::UnboundedReceiver<Result<Vec<u8>, StreamError>>,
}

impl StreamSource {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<Vec<u8>, StreamError>>) -> Self {
        StreamSource { rx }
    }
}

impl Stream for StreamSource {
    type Item = Result<Vec<u8>, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use futures::FutureExt;
    use rtcdc_proto::encode_frame;

    use super::*;
    use crate::channel::ReadyState;
    use crate::memory::MemoryChannel;
    use crate::stat::Direction;
    use crate::state::StreamState;
    use crate::stream::StreamInit;

    type RunResult = Rc<RefCell<Option<Result<(), StreamError>>>>;

    struct Harness {
        pool: LocalPool,
        channel: MemoryChannel,
        stream: WebRtcStream,
        source: StreamSource,
        result: RunResult,
    }

    impl Harness {
        fn new() -> Self {
            let pool = LocalPool::new();
            let channel = MemoryChannel::new("inbound-test", ReadyState::Open);
            let (stream, inbound) =
                WebRtcStream::new(channel.clone(), StreamInit::new(Direction::Inbound));
            let source = stream.source().unwrap();

            let result: RunResult = Rc::new(RefCell::new(None));
            let slot = result.clone();
            pool.spawner()
                .spawn_local(async move {
                    *slot.borrow_mut() = Some(inbound.run().await);
                })
                .unwrap();

            Harness {
                pool,
                channel,
                stream,
                source,
                result,
            }
        }

        fn receive(&mut self, raw: &[u8]) {
            self.channel.inject(raw);
            self.pool.run_until_stalled();
        }

        /// すでに届いているペイロードをすべて読む
        fn read_ready(&mut self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            while let Some(Some(Ok(payload))) = self.source.next().now_or_never() {
                out.push(payload);
            }
            out
        }
    }

    fn data(payload: &[u8]) -> Vec<u8> {
        encode_frame(&Envelope::data(payload.to_vec()))
    }

    fn control(flag: Flag) -> Vec<u8> {
        encode_frame(&Envelope::control(flag))
    }

    #[test]
    fn test_data_reaches_reader() {
        let mut h = Harness::new();
        h.receive(&data(b"hello"));
        assert_eq!(h.read_ready(), vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_frame_split_across_messages_yields_one_payload() {
        let mut h = Harness::new();
        let frame = data(&[1, 2, 3, 4, 5]);
        h.receive(&frame[..3]);
        assert!(h.read_ready().is_empty(), "フレームが揃うまで何も出ない");
        h.receive(&frame[3..]);

        assert_eq!(h.read_ready(), vec![vec![1, 2, 3, 4, 5]]);
    }

    #[test]
    fn test_separate_frames_keep_arrival_order() {
        let mut h = Harness::new();
        h.receive(&data(&[1, 2, 3]));
        h.receive(&data(&[4, 5]));

        // 1 メッセージに 2 フレーム
        let mut both = data(&[6]);
        both.extend(data(&[7, 8]));
        h.receive(&both);

        assert_eq!(
            h.read_ready(),
            vec![vec![1, 2, 3], vec![4, 5], vec![6], vec![7, 8]]
        );
    }

    #[test]
    fn test_fin_closes_read_and_answers_stop_sending() {
        let mut h = Harness::new();
        h.receive(&data(b"last"));
        h.receive(&control(Flag::Fin));

        assert_eq!(h.stream.state(), StreamState::ReadClosed);
        assert_eq!(h.channel.sent(), vec![control(Flag::StopSending)]);
        // FIN より前に届いた分は読める。その後は終端
        assert_eq!(h.read_ready(), vec![b"last".to_vec()]);
        assert!(matches!(h.source.next().now_or_never(), Some(None)));
    }

    #[test]
    fn test_stop_sending_closes_write_without_fin() {
        let mut h = Harness::new();
        h.receive(&control(Flag::StopSending));

        assert_eq!(h.stream.state(), StreamState::WriteClosed);
        assert!(h.channel.sent().is_empty(), "STOP_SENDING には FIN を返さない");
        assert_eq!(h.stream.write_closed().now_or_never(), Some(()));
    }

    #[test]
    fn test_reset_closes_read() {
        let mut h = Harness::new();
        h.receive(&control(Flag::Reset));

        assert!(h.stream.is_read_closed());
        assert!(!h.stream.is_write_closed());
    }

    #[test]
    fn test_flags_from_both_sides_close_stream() {
        let mut h = Harness::new();
        h.receive(&control(Flag::Fin));
        assert!(!h.stream.is_closed());
        h.receive(&control(Flag::StopSending));

        assert!(h.stream.is_closed());
        assert_eq!(h.channel.state(), ReadyState::Closed);
        // close で受信キューが終端し、受信ループも終わる
        assert!(matches!(*h.result.borrow(), Some(Ok(()))));
    }

    #[test]
    fn test_data_after_close_read_is_dropped() {
        let mut h = Harness::new();
        h.receive(&data(&[1, 2]));
        h.stream.close_read();
        h.receive(&data(&[3]));

        assert_eq!(h.read_ready(), vec![vec![1, 2]]);
        assert!(matches!(h.source.next().now_or_never(), Some(None)));
    }

    #[test]
    fn test_data_after_fin_in_same_message_is_dropped() {
        let mut h = Harness::new();
        let mut chunk = data(b"a");
        chunk.extend(control(Flag::Fin));
        chunk.extend(data(b"b"));
        h.receive(&chunk);

        assert_eq!(h.read_ready(), vec![b"a".to_vec()]);
    }

    #[test]
    fn test_unknown_flag_is_no_op() {
        let mut h = Harness::new();
        let unknown = encode_frame(&Envelope {
            flag: Some(9),
            message: None,
        });
        h.receive(&unknown);
        h.receive(&data(b"still open"));

        assert_eq!(h.stream.state(), StreamState::Open);
        assert_eq!(h.read_ready(), vec![b"still open".to_vec()]);
        assert!(h.channel.sent().is_empty());
    }

    #[test]
    fn test_empty_data_envelope_is_not_delivered() {
        let mut h = Harness::new();
        h.receive(&encode_frame(&Envelope::default()));
        h.receive(&data(&[]));
        h.receive(&data(b"x"));

        assert_eq!(h.read_ready(), vec![b"x".to_vec()]);
    }

    #[test]
    fn test_decode_error_surfaces_once_and_closes_read() {
        let mut h = Harness::new();
        h.receive(&[0xFF; 10]);

        assert!(matches!(
            h.source.next().now_or_never(),
            Some(Some(Err(StreamError::Proto(ProtoError::MalformedLength))))
        ));
        assert!(matches!(h.source.next().now_or_never(), Some(None)));
        assert!(h.stream.is_read_closed());
        assert_eq!(h.channel.sent(), vec![control(Flag::StopSending)]);
        assert!(matches!(
            *h.result.borrow(),
            Some(Err(StreamError::Proto(ProtoError::MalformedLength)))
        ));
    }

    #[test]
    fn test_truncated_frame_at_close_is_reported() {
        let mut h = Harness::new();
        let frame = data(b"cut");
        h.receive(&frame[..2]);
        h.stream.close();
        h.pool.run_until_stalled();

        assert!(matches!(
            *h.result.borrow(),
            Some(Err(StreamError::Proto(ProtoError::Truncated { remaining: 2 })))
        ));
    }

    #[test]
    fn test_data_queued_before_remote_close_is_still_read() {
        let mut h = Harness::new();
        // 受信パイプラインが動く前に相手が送って閉じる
        h.channel.inject(&data(b"bye"));
        h.channel.remote_close();
        assert!(h.stream.is_closed());

        h.pool.run_until_stalled();
        assert_eq!(h.read_ready(), vec![b"bye".to_vec()]);
        assert!(matches!(h.source.next().now_or_never(), Some(None)));
        assert!(matches!(*h.result.borrow(), Some(Ok(()))));
    }

    #[test]
    fn test_data_after_fin_is_dropped_while_draining() {
        let mut h = Harness::new();
        h.channel.inject(&data(b"a"));
        h.channel.inject(&control(Flag::Fin));
        h.channel.inject(&data(b"b"));
        h.channel.remote_close();

        h.pool.run_until_stalled();
        assert_eq!(h.read_ready(), vec![b"a".to_vec()]);
        assert!(matches!(h.source.next().now_or_never(), Some(None)));
    }

    #[test]
    fn test_frame_larger_than_message_size_is_accepted() {
        let mut h = Harness::new();
        let payload = vec![1u8; 20 * 1024];
        assert!(payload.len() > h.stream.config().max_message_size);

        h.receive(&data(&payload));

        assert_eq!(h.read_ready(), vec![payload]);
        assert!(!h.stream.is_read_closed());
    }

    #[test]
    fn test_frame_over_receive_limit_closes_read() {
        let mut h = Harness::new();
        let limit = h.stream.config().max_frame_len;
        // 長さヘッダーだけで判定される
        let mut header = Vec::new();
        let mut len = limit + 1;
        while len >= 0x80 {
            header.push((len as u8) | 0x80);
            len >>= 7;
        }
        header.push(len as u8);
        h.receive(&header);

        assert!(matches!(
            h.source.next().now_or_never(),
            Some(Some(Err(StreamError::Proto(ProtoError::FrameTooLarge { .. }))))
        ));
        assert!(h.stream.is_read_closed());
    }
}
