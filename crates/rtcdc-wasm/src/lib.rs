//! # rtcdc-wasm
//!
//! wasm-bindgen エクスポート：ブラウザ / Node.js から呼び出す公開 API。
//!
//! ## 使用方法（TypeScript）
//!
//! ```typescript
//! import { RtcStream, init_panic_hook } from '../rtcdc-wasm-pkg/rtcdc_wasm';
//!
//! // パニック時のスタックトレースを有効化（開発時）
//! init_panic_hook();
//!
//! // データチャンネルをストリームとして包む
//! const stream = new RtcStream(pc.createDataChannel("7"), "outbound");
//!
//! // 送信（channel が open になってから実際に送られる）
//! stream.write(new TextEncoder().encode("hello"));
//! // "hello" を送り終えてから FIN
//! stream.closeWrite();
//!
//! // 受信（終端で undefined）
//! for (let chunk = await stream.read(); chunk; chunk = await stream.read()) {
//!     console.log(chunk);
//! }
//! ```

use wasm_bindgen::prelude::*;

pub mod channel;
pub mod stream;

pub use channel::RtcChannel;
pub use stream::RtcStream;

/// パニック時にブラウザコンソールにスタックトレースを出力する
///
/// 開発時に必ず呼び出すこと。本番ビルドでは feature flag で無効化可能。
#[wasm_bindgen]
pub fn init_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}
