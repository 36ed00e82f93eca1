use crate::ids::{ObjectId, RequestId};
use crate::messages::{ConsoleOutputFragment, InvocationResult};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a host sends everything that flows back to clients out of band
pub trait HostOutbox: Send + Sync {
    fn deliver_result(&self, result: InvocationResult);
    fn console(&self, fragment: ConsoleOutputFragment);
}

#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Result(InvocationResult),
    Console(ConsoleOutputFragment),
}

impl HostOutbox for mpsc::UnboundedSender<OutboundEvent> {
    fn deliver_result(&self, result: InvocationResult) {
        let _ = self.send(OutboundEvent::Result(result));
    }

    fn console(&self, fragment: ConsoleOutputFragment) {
        let _ = self.send(OutboundEvent::Console(fragment));
    }
}

#[derive(Debug, Default)]
struct Flags {
    suspended: bool,
    cancelled: bool,
}

/// Suspend/resume switch of one running invocation.
///
/// Suspension is cooperative: the invocation parks the next time it reaches
/// [`InvocationContext::checkpoint`].
#[derive(Debug, Default)]
pub struct InvocationControl {
    flags: Mutex<Flags>,
    wake: Condvar,
}

impl InvocationControl {
    /// Returns false if the invocation was already suspended
    pub fn suspend(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.suspended || flags.cancelled {
            return false;
        }
        flags.suspended = true;
        true
    }

    /// Returns false if the invocation was not suspended
    pub fn resume(&self) -> bool {
        let mut flags = self.flags.lock();
        if !flags.suspended {
            return false;
        }
        flags.suspended = false;
        self.wake.notify_all();
        true
    }

    /// Wakes a parked invocation for good; its object is gone
    pub fn cancel(&self) {
        let mut flags = self.flags.lock();
        flags.cancelled = true;
        flags.suspended = false;
        self.wake.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.lock().suspended
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.lock().cancelled
    }

    fn wait_while_suspended(&self) -> bool {
        let mut flags = self.flags.lock();
        while flags.suspended {
            self.wake.wait(&mut flags);
        }
        !flags.cancelled
    }
}

/// Handed to [`CloudObject::invoke`](crate::types::CloudObject::invoke)
pub struct InvocationContext {
    object_id: ObjectId,
    request_id: RequestId,
    method: String,
    control: Arc<InvocationControl>,
    outbox: Arc<dyn HostOutbox>,
}

impl InvocationContext {
    pub(crate) fn new(
        object_id: ObjectId,
        request_id: RequestId,
        method: String,
        control: Arc<InvocationControl>,
        outbox: Arc<dyn HostOutbox>,
    ) -> Self {
        Self { object_id, request_id, method, control, outbox }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Blocks while the invocation is suspended. Returns false once the object
    /// was destroyed and the method should stop early.
    pub fn checkpoint(&self) -> bool {
        self.control.wait_while_suspended()
    }

    pub fn is_suspended(&self) -> bool {
        self.control.is_suspended()
    }

    pub fn println(&self, text: impl Into<String>) {
        self.emit(text.into(), false);
    }

    pub fn eprintln(&self, text: impl Into<String>) {
        self.emit(text.into(), true);
    }

    fn emit(&self, text: String, is_err: bool) {
        self.outbox.console(ConsoleOutputFragment {
            object_id: self.object_id,
            source: self.method.clone(),
            is_err,
            text,
            line_separator: "\n".into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn suspend_and_resume_toggle_once() {
        let control = InvocationControl::default();
        assert!(!control.resume());
        assert!(control.suspend());
        assert!(!control.suspend());
        assert!(control.resume());
        assert!(!control.is_suspended());
    }

    #[test]
    fn checkpoint_parks_until_resumed() {
        let control = Arc::new(InvocationControl::default());
        control.suspend();

        let parked = control.clone();
        let worker = std::thread::spawn(move || parked.wait_while_suspended());

        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());
        control.resume();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn cancel_releases_a_parked_invocation() {
        let control = Arc::new(InvocationControl::default());
        control.suspend();

        let parked = control.clone();
        let worker = std::thread::spawn(move || parked.wait_while_suspended());
        control.cancel();
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn console_output_is_tagged_with_object_and_method() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let object = ObjectId::new();
        let ctx = InvocationContext::new(
            object,
            RequestId::new(),
            "report".into(),
            Arc::new(InvocationControl::default()),
            Arc::new(tx),
        );
        ctx.eprintln("low disk");

        match rx.try_recv().unwrap() {
            OutboundEvent::Console(fragment) => {
                assert_eq!(fragment.object_id, object);
                assert_eq!(fragment.source, "report");
                assert!(fragment.is_err);
                assert_eq!(fragment.text, "low disk");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
