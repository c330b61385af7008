//! `RTCDataChannel` を `DataChannel` として包む
//!
//! ブラウザ / Node.js の RTCDataChannel のイベントハンドラ（onopen / onmessage /
//! onclose / onerror）を Rust のクロージャで登録し、ストリームへ転送する。

use std::cell::RefCell;

use rtcdc_stream::{ChannelError, ChannelEvents, DataChannel, ReadyState};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{Event, MessageEvent, RtcDataChannel, RtcDataChannelState, RtcDataChannelType};

/// 登録済みのイベントハンドラ（JS 側から参照されている間は破棄できない）
struct Handlers {
    _onopen: Closure<dyn FnMut(Event)>,
    _onmessage: Closure<dyn FnMut(MessageEvent)>,
    _onclose: Closure<dyn FnMut(Event)>,
    _onerror: Closure<dyn FnMut(Event)>,
}

/// RTCDataChannel ラッパー
pub struct RtcChannel {
    inner: RtcDataChannel,
    handlers: RefCell<Option<Handlers>>,
}

impl RtcChannel {
    pub fn new(inner: RtcDataChannel) -> Self {
        // メッセージを Blob ではなく ArrayBuffer で受け取る
        inner.set_binary_type(RtcDataChannelType::Arraybuffer);
        RtcChannel {
            inner,
            handlers: RefCell::new(None),
        }
    }

    fn detach(&self) {
        self.inner.set_onopen(None);
        self.inner.set_onmessage(None);
        self.inner.set_onclose(None);
        self.inner.set_onerror(None);

        let handlers = self.handlers.borrow_mut().take();
        if let Some(handlers) = handlers {
            // close はハンドラの実行中に呼ばれることがあるので、破棄は次のタスクで行う
            wasm_bindgen_futures::spawn_local(async move {
                drop(handlers);
            });
        }
    }
}

impl DataChannel for RtcChannel {
    fn label(&self) -> String {
        self.inner.label()
    }

    fn ready_state(&self) -> ReadyState {
        match self.inner.ready_state() {
            RtcDataChannelState::Connecting => ReadyState::Connecting,
            RtcDataChannelState::Open => ReadyState::Open,
            RtcDataChannelState::Closing => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }

    fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.inner
            .send_with_u8_array(data)
            .map_err(|e| ChannelError::Send(format!("{:?}", e)))
    }

    fn close(&self) -> Result<(), ChannelError> {
        self.detach();
        self.inner.close();
        Ok(())
    }

    fn register(&self, events: ChannelEvents) {
        let ev = events.clone();
        let onopen = Closure::<dyn FnMut(Event)>::new(move |_evt: Event| ev.on_open());

        let ev = events.clone();
        let onmessage = Closure::<dyn FnMut(MessageEvent)>::new(move |evt: MessageEvent| {
            // binaryType = arraybuffer。文字列メッセージは空配列になり、ストリーム側で捨てられる
            let data = js_sys::Uint8Array::new(&evt.data()).to_vec();
            ev.on_message(&data);
        });

        let ev = events.clone();
        let onclose = Closure::<dyn FnMut(Event)>::new(move |_evt: Event| ev.on_close());

        let onerror = Closure::<dyn FnMut(Event)>::new(move |evt: Event| {
            events.on_error(ChannelError::Transport(evt.type_()));
        });

        self.inner.set_onopen(Some(onopen.as_ref().unchecked_ref()));
        self.inner.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
        self.inner.set_onclose(Some(onclose.as_ref().unchecked_ref()));
        self.inner.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        *self.handlers.borrow_mut() = Some(Handlers {
            _onopen: onopen,
            _onmessage: onmessage,
            _onclose: onclose,
            _onerror: onerror,
        });
    }
}
