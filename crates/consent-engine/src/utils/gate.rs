use tokio::sync::watch;

/// One-shot gate: opens at most once and stays open, any number of waiters.
///
/// Waiters that subscribe after the gate opened resolve immediately.
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Open the gate. Calling again is a no-op.
    pub fn open(&self) {
        self.tx.send_if_modified(|opened| {
            if *opened {
                false
            } else {
                *opened = true;
                true
            }
        });
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the gate has been opened.
    pub async fn opened(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
