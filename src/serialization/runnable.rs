//! The frame and step-result types shared by the serializer and
//! deserializer stack machines.

use std::collections::VecDeque;

/// Outcome of a single step invocation (§4.7 "Step function contract").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The frame finished; pop it.
    Done,
    /// Re-run this frame immediately (used to move on to the next
    /// container element without waiting for more buffer).
    Continue,
    /// The buffer is exhausted (encode) or starved (decode); return control
    /// to the caller with this frame still on top of the stack.
    Wait,
}

/// One frame of the stack machine. `S` is the per-direction I/O context
/// (`WriteSink` for the serializer, `ReadSource` for the deserializer). A
/// step may enqueue child frames into the `children` queue it's handed;
/// those run to completion before this frame is polled again, giving
/// depth-first, resumable traversal of nested values without recursion —
/// the runtime analogue of the original engine's sentinel-delimited deque.
pub(crate) struct Frame<S: ?Sized> {
    pub name: &'static str,
    #[allow(clippy::type_complexity)]
    pub step: Box<
        dyn FnMut(&mut S, &mut VecDeque<Frame<S>>) -> Result<StepResult, crate::error::SerializationError>
            + Send,
    >,
}

impl<S: ?Sized> Frame<S> {
    pub fn new<F>(name: &'static str, step: F) -> Self
    where
        F: FnMut(&mut S, &mut VecDeque<Frame<S>>) -> Result<StepResult, crate::error::SerializationError>
            + Send
            + 'static,
    {
        Frame {
            name,
            step: Box::new(step),
        }
    }
}
