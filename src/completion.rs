use parking_lot::Mutex;
use tokio::sync::oneshot;

/// One-shot completion signal of a protocol instance.
///
/// Several paths may try to finish an instance (last reply, too many
/// failures, timeout); only the first one is delivered.
pub struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Completion {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Deliver `value` if nothing was delivered before. Returns whether this call
    /// delivered.
    pub fn finish(&self, value: T) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                // The receiver may be gone; the instance is finished regardless.
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tx.lock().is_none()
    }
}
