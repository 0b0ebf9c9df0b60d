//! Promises: the eventual results of async functions.

use parking_lot::Mutex;
use refuse::{NoMapping, Trace};

use crate::runtime::value::Value;
use crate::vm::FrameId;

/// The state of a [`Promise`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PromiseStatus {
    /// The promise has not been settled.
    Pending,
    /// The promise was settled with a value.
    Fulfilled,
    /// The promise was settled with an error value.
    Rejected,
}

/// A three-state container for a value that becomes available later.
///
/// Frames that await a pending promise are parked on it. Settling the
/// promise hands the parked frames back to the caller in the order they
/// were parked, so they can be scheduled for resumption.
#[derive(Debug)]
pub struct Promise(Mutex<PromiseState>);

#[derive(Debug)]
struct PromiseState {
    status: PromiseStatus,
    value: Value,
    waiters: Vec<FrameId>,
}

impl Promise {
    /// Returns a new pending promise.
    #[must_use]
    pub fn pending() -> Self {
        Self(Mutex::new(PromiseState {
            status: PromiseStatus::Pending,
            value: Value::Null,
            waiters: Vec::new(),
        }))
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> PromiseStatus {
        self.0.lock().status
    }

    /// Returns the current status and the settled value, which is `Null`
    /// while pending.
    #[must_use]
    pub fn settled(&self) -> (PromiseStatus, Value) {
        let state = self.0.lock();
        (state.status, state.value)
    }

    /// Parks `frame` until this promise is settled.
    pub fn park(&self, frame: FrameId) {
        self.0.lock().waiters.push(frame);
    }

    /// Settles this promise with `value`, rejecting it if `value` is an
    /// error. Returns the frames that were waiting on it.
    ///
    /// Returns `None` if the promise had already been settled.
    pub fn settle(&self, value: Value) -> Option<Vec<FrameId>> {
        let mut state = self.0.lock();
        if state.status != PromiseStatus::Pending {
            return None;
        }
        state.status = if value.is_error() {
            PromiseStatus::Rejected
        } else {
            PromiseStatus::Fulfilled
        };
        state.value = value;
        Some(std::mem::take(&mut state.waiters))
    }
}

impl NoMapping for Promise {}

impl Trace for Promise {
    const MAY_CONTAIN_REFERENCES: bool = true;

    fn trace(&self, tracer: &mut refuse::Tracer) {
        self.0.lock().value.trace(tracer);
    }
}
