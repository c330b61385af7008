//! RtcStream wasm-bindgen エクスポート
//!
//! JS から RTCDataChannel を渡してストリームを作る主エントリポイント。
//! 受信パイプラインと送信パイプラインは `spawn_local` で JS のイベントループ上に載せる。

use std::cell::RefCell;
use std::rc::Rc;

use futures::StreamExt;
use js_sys::{Promise, Uint8Array};
use rtcdc_stream::{
    Direction, StreamConfig, StreamError, StreamInit, StreamSource, StreamWriter, WebRtcStream,
};
use tracing::warn;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::{future_to_promise, spawn_local};
use web_sys::RtcDataChannel;

use crate::channel::RtcChannel;

/// RTCDataChannel 上の双方向バイトストリーム
///
/// ## 内部アーキテクチャ
///
/// ```text
/// RtcStream
///   ├── WebRtcStream (rtcdc-stream) - 状態機械・パイプライン
///   ├── RtcChannel   (channel)      - RTCDataChannel のイベント橋渡し
///   ├── Inbound      (spawn_local)  - 受信ループ
///   └── Outbound     (spawn_local)  - write() で積んだチャンクの送信ループ
/// ```
///
/// ## スレッド安全性
///
/// WASM は シングルスレッドのため、`!Send + !Sync` を満たす。
#[wasm_bindgen]
pub struct RtcStream {
    stream: WebRtcStream,
    /// 受信ペイロード（read() の実行中は None）
    source: Rc<RefCell<Option<StreamSource>>>,
    /// 送信ループへのチャンク
    writer: StreamWriter,
}

#[wasm_bindgen]
impl RtcStream {
    /// ストリームを生成する
    ///
    /// # 引数
    /// - `channel`: `RTCPeerConnection.createDataChannel()` などで得たチャンネル
    /// - `direction`: `"inbound"` または `"outbound"`
    /// - `config_json`: 省略可。例: `{"maxMessageSize": 16384}`
    ///
    /// # エラー
    /// - direction が不正
    /// - config_json のパース失敗
    ///
    /// # 例（TypeScript）
    /// ```typescript
    /// const stream = new RtcStream(pc.createDataChannel("1"), "outbound");
    /// ```
    #[wasm_bindgen(constructor)]
    pub fn new(
        channel: RtcDataChannel,
        direction: &str,
        config_json: Option<String>,
    ) -> Result<RtcStream, JsError> {
        let direction = parse_direction(direction)?;
        let config = match config_json {
            Some(json) => serde_json::from_str::<StreamConfig>(&json)
                .map_err(|e| JsError::new(&format!("Invalid stream config: {}", e)))?,
            None => StreamConfig::default(),
        };

        let init = StreamInit::new(direction).with_config(config);
        let (stream, inbound) = WebRtcStream::new(RtcChannel::new(channel), init);

        let id = stream.id().to_owned();
        spawn_local(async move {
            if let Err(err) = inbound.run().await {
                warn!(stream = %id, %err, "inbound pipeline failed");
            }
        });

        let (writer, outbound) = stream.writer();
        let id = stream.id().to_owned();
        spawn_local(async move {
            if let Err(err) = outbound.run().await {
                warn!(stream = %id, %err, "outbound pipeline failed");
            }
        });

        let source = stream.source();
        Ok(RtcStream {
            stream,
            source: Rc::new(RefCell::new(source)),
            writer,
        })
    }

    /// ストリーム ID（チャンネルのラベル）
    #[wasm_bindgen(getter)]
    pub fn id(&self) -> String {
        self.stream.id().to_owned()
    }

    /// 現在の状態（"unopened" / "open" / "readClosed" / "writeClosed" / "closed"）
    #[wasm_bindgen(getter)]
    pub fn state(&self) -> String {
        let state = match self.stream.state() {
            rtcdc_stream::StreamState::Unopened => "unopened",
            rtcdc_stream::StreamState::Open => "open",
            rtcdc_stream::StreamState::ReadClosed => "readClosed",
            rtcdc_stream::StreamState::WriteClosed => "writeClosed",
            rtcdc_stream::StreamState::Closed => "closed",
        };
        state.to_owned()
    }

    /// 送信キューにデータを積む
    ///
    /// 実際の送信は channel-opened の後。書き込み側が閉じていれば捨てられる。
    pub fn write(&self, data: &[u8]) -> Result<(), JsError> {
        self.writer
            .write(data.to_vec())
            .map_err(|e| JsError::new(&e.to_string()))
    }

    /// 次の受信チャンクを読む
    ///
    /// # 戻り値
    /// `Promise<Uint8Array | undefined>`。読み込み側が閉じていれば `undefined`。
    /// デコードエラーは reject される。
    pub fn read(&self) -> Promise {
        let slot = self.source.clone();
        future_to_promise(async move {
            let taken = slot.borrow_mut().take();
            let Some(mut source) = taken else {
                return Err(JsError::new("read() is already pending").into());
            };
            let next = source.next().await;
            *slot.borrow_mut() = Some(source);

            match next {
                Some(Ok(data)) => Ok(Uint8Array::from(data.as_slice()).into()),
                Some(Err(err)) => Err(JsError::new(&err.to_string()).into()),
                None => Ok(JsValue::UNDEFINED),
            }
        })
    }

    /// 読み込み側を閉じる（STOP_SENDING）
    #[wasm_bindgen(js_name = "closeRead")]
    pub fn close_read(&self) {
        self.stream.close_read();
    }

    /// 書き込み側を閉じる（FIN）
    ///
    /// それまでに write() したデータを送り終えてから FIN を送る。
    #[wasm_bindgen(js_name = "closeWrite")]
    pub fn close_write(&self) {
        self.writer.close_write();
    }

    /// 書き込み側をリセットする（RESET）
    pub fn reset(&self) {
        self.stream.reset();
    }

    /// ローカルのエラーで中断する（相手には通知しない）
    pub fn abort(&self, reason: String) {
        self.stream.abort(StreamError::Aborted(reason));
    }

    /// ストリームを閉じてチャンネルを解放する
    pub fn close(&self) {
        self.stream.close();
    }

    /// ストリーム統計を JSON 文字列で返す
    ///
    /// # 戻り値
    /// ```json
    /// { "direction": "outbound", "timeline": { "open": 1700000000000, "close": null } }
    /// ```
    #[wasm_bindgen(js_name = "getStats")]
    pub fn get_stats(&self) -> Result<String, JsError> {
        serde_json::to_string(&self.stream.stat())
            .map_err(|e| JsError::new(&format!("Stats serialization failed: {}", e)))
    }
}

/// JS から渡された方向文字列を解釈する
pub fn parse_direction(direction: &str) -> Result<Direction, JsError> {
    match direction {
        "inbound" => Ok(Direction::Inbound),
        "outbound" => Ok(Direction::Outbound),
        other => Err(JsError::new(&format!("Invalid direction: {}", other))),
    }
}
