//! The micro-task queue that resumes async frames.

use alot::Lots;
use refuse::{Ref, Trace};

use super::{ExecutionError, FrameId, FrameState, VmContext};
use crate::runtime::promise::{Promise, PromiseStatus};
use crate::runtime::value::Value;

/// A unit of work in the micro-task queue.
pub(crate) enum Task {
    /// Continue a parked frame whose promise has settled.
    Resume(FrameId),
    /// Settle a promise created by `defer`.
    Resolve {
        promise: Ref<Promise>,
        value: Value,
    },
}

impl Task {
    pub(crate) fn trace(&self, tracer: &mut refuse::Tracer) {
        match self {
            Task::Resume(_) => {}
            Task::Resolve { promise, value } => {
                tracer.mark(*promise);
                value.trace(tracer);
            }
        }
    }
}

impl VmContext<'_, '_> {
    /// Returns a pending promise that the scheduler settles with `value` on
    /// its next pass.
    pub fn defer(&mut self, value: Value) -> Value {
        let promise = Ref::new(Promise::pending(), self.guard);
        self.vm.queue.push_back(Task::Resolve { promise, value });
        Value::Promise(promise)
    }

    /// Settles `promise` and queues every frame parked on it, in the order
    /// they were parked.
    pub(crate) fn settle(
        &mut self,
        promise: Ref<Promise>,
        value: Value,
    ) -> Result<(), ExecutionError> {
        let Some(waiters) = promise
            .load(self.guard)
            .ok_or(ExecutionError::ValueFreed)?
            .settle(value)
        else {
            return Ok(());
        };
        debug!(waiters = waiters.len(), "promise settled");
        self.vm
            .queue
            .extend(waiters.into_iter().map(Task::Resume));
        Ok(())
    }

    /// Runs queued tasks until the queue is empty.
    pub(crate) fn run_scheduler(&mut self) -> Result<(), ExecutionError> {
        while let Some(task) = self.vm.queue.pop_front() {
            match task {
                Task::Resolve { promise, value } => self.settle(promise, value)?,
                Task::Resume(id) => self.resume(id)?,
            }
        }

        let stranded = self
            .vm
            .frames
            .iter()
            .filter(|frame| frame.state == FrameState::Awaiting)
            .count();
        if stranded > 0 {
            warn!(frames = stranded, "frames still awaiting when the queue drained");
            self.vm.frames = Lots::new();
        }
        Ok(())
    }

    fn resume(&mut self, id: FrameId) -> Result<(), ExecutionError> {
        let guard = &*self.guard;
        let frame = self
            .vm
            .frames
            .get_mut(id.0)
            .ok_or(ExecutionError::InvalidResume)?;
        if frame.state != FrameState::Awaiting {
            return Err(ExecutionError::InvalidResume);
        }
        let Some(Value::Promise(awaited)) = frame.stack.last().copied() else {
            return Err(ExecutionError::InvalidResume);
        };
        let (status, value) = awaited
            .load(guard)
            .ok_or(ExecutionError::ValueFreed)?
            .settled();
        if status == PromiseStatus::Pending {
            return Err(ExecutionError::InvalidResume);
        }
        if let Some(top) = frame.stack.last_mut() {
            *top = value;
        }
        frame.state = FrameState::Running;
        debug!(frame = ?id, "frame resumed");

        self.run_frame(id)?;
        Ok(())
    }
}
