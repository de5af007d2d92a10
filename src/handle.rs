use crate::error::Result;

use crossbeam::channel::Receiver;

/// Completion token for one outstanding non-blocking RMA operation.
///
/// A fresh handle is the null sentinel: waiting on it is a no-op. Waiting on
/// a completed or pending handle blocks until the operation finishes and
/// resets the handle back to null, so a second wait is always safe. Handles
/// move into whichever thread awaits them; they are not shareable.
#[derive(Debug, Default)]
pub struct RmaHandle {
    inner: Option<HandleState>,
}

#[derive(Debug)]
enum HandleState {
    /// Completed at issue time (node-local backends copy eagerly).
    Ready,
    /// Completion signalled by the issuing side.
    Pending(Receiver<()>),
}

impl RmaHandle {
    /// The null handle: no outstanding operation.
    pub fn null() -> RmaHandle {
        RmaHandle { inner: None }
    }

    pub(crate) fn ready() -> RmaHandle {
        RmaHandle {
            inner: Some(HandleState::Ready),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn pending(rx: Receiver<()>) -> RmaHandle {
        RmaHandle {
            inner: Some(HandleState::Pending(rx)),
        }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Block until the wrapped operation completes, then reset to null.
    pub fn wait(&mut self) -> Result<()> {
        match self.inner.take() {
            None | Some(HandleState::Ready) => Ok(()),
            Some(HandleState::Pending(rx)) => {
                // A dropped sender means the issuing side already completed.
                let _ = rx.recv();
                Ok(())
            }
        }
    }

    /// Poll for completion. Returns true (and resets to null) once the
    /// operation has finished; a null handle tests as complete.
    pub fn test(&mut self) -> Result<bool> {
        match self.inner.take() {
            None | Some(HandleState::Ready) => Ok(true),
            Some(HandleState::Pending(rx)) => match rx.try_recv() {
                Ok(()) => Ok(true),
                Err(crossbeam::channel::TryRecvError::Disconnected) => Ok(true),
                Err(crossbeam::channel::TryRecvError::Empty) => {
                    self.inner = Some(HandleState::Pending(rx));
                    Ok(false)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_wait_is_noop() {
        let mut h = RmaHandle::null();
        assert!(h.is_null());
        h.wait().unwrap();
        h.wait().unwrap();
        assert!(h.is_null());
    }

    #[test]
    fn wait_twice_after_completion() {
        let mut h = RmaHandle::ready();
        assert!(!h.is_null());
        h.wait().unwrap();
        assert!(h.is_null());
        h.wait().unwrap();
    }

    #[test]
    fn test_pending_then_complete() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut h = RmaHandle::pending(rx);
        assert!(!h.test().unwrap());
        tx.send(()).unwrap();
        assert!(h.test().unwrap());
        assert!(h.is_null());
        assert!(h.test().unwrap());
    }
}
