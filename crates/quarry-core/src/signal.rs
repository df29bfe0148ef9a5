//! Cooperative abort. The handle flips a watch flag; the signal side is
//! cheap to clone and can be polled synchronously or awaited.

use tokio::sync::watch;

pub fn abort_channel() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once abort is requested. If the handle is gone without an
    /// abort, this never resolves; the run simply finishes on its own.
    pub async fn raised(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
