//! 一度だけ発火するシグナル

use std::cell::RefCell;

use futures::channel::oneshot;
use futures::future::{FusedFuture, FutureExt, Shared};

/// 一度だけ発火するライフサイクルイベント
///
/// 発火前に待っていた側も、発火後に待ち始めた側も、同じ完了を受け取る。
/// `wait()` は何度呼んでもよい。
///
/// `Signal` 自体が発火せずに破棄された場合も待機側は完了する
/// （待ち続けてデッドロックすることはない）。
pub struct Signal {
    trigger: RefCell<Option<oneshot::Sender<()>>>,
    fired: Shared<oneshot::Receiver<()>>,
}

impl Signal {
    pub fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        Signal {
            trigger: RefCell::new(Some(tx)),
            fired: rx.shared(),
        }
    }

    /// 発火する。初回のみ `true`。
    pub fn fire(&self) -> bool {
        let Some(tx) = self.trigger.borrow_mut().take() else {
            return false;
        };
        // 受信側は self.fired が保持しているので失敗しない
        let _ = tx.send(());
        true
    }

    pub fn is_fired(&self) -> bool {
        self.trigger.borrow().is_none()
    }

    /// 発火を待つ Future
    pub fn wait(&self) -> impl FusedFuture<Output = ()> + Unpin + 'static {
        self.fired.clone().map(|_| ())
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn test_fire_once() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire(), "2 回目の発火は無視される");
        assert!(signal.is_fired());
    }

    #[test]
    fn test_waiters_before_and_after_fire() {
        let signal = Signal::new();
        let mut early = signal.wait();
        let early2 = signal.wait();

        assert!((&mut early).now_or_never().is_none(), "発火前は完了しない");

        signal.fire();

        block_on(early);
        block_on(early2);
        // 発火後に待ち始めても即座に完了する
        assert_eq!(signal.wait().now_or_never(), Some(()));
        assert_eq!(signal.wait().now_or_never(), Some(()));
    }

    #[test]
    fn test_dropped_signal_releases_waiters() {
        let signal = Signal::new();
        let waiter = signal.wait();
        drop(signal);
        assert_eq!(waiter.now_or_never(), Some(()));
    }
}
