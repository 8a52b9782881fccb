//! The stack-machine loop shared by [`super::serializer::Serializer`] and
//! [`super::deserializer::Deserializer`] (§4.7).
//!
//! The queue is FIFO for sibling work pushed by [`Engine::push`] (so a
//! sequence of top-level `push_*` calls encodes in call order), but any
//! frame's step can enqueue children that are spliced in immediately ahead
//! of the rest of the queue — the moral equivalent of the original engine's
//! sentinel-delimited deque, without literally modeling a sentinel.

use std::collections::VecDeque;

use crate::error::SerializationError;

use super::runnable::{Frame, StepResult};

pub(crate) struct Engine<S: ?Sized> {
    stack: VecDeque<Frame<S>>,
    error: Option<SerializationError>,
}

impl<S: ?Sized> Engine<S> {
    pub fn new() -> Self {
        Engine {
            stack: VecDeque::new(),
            error: None,
        }
    }

    pub fn push(&mut self, frame: Frame<S>) {
        self.stack.push_back(frame);
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn error(&self) -> Option<&SerializationError> {
        self.error.as_ref()
    }

    /// Move every queued frame, in order, into `target`. Used to transplant
    /// a scratch engine's output into a parent frame's child queue.
    pub fn drain_into(&mut self, target: &mut VecDeque<Frame<S>>) {
        while let Some(f) = self.stack.pop_front() {
            target.push_back(f);
        }
    }

    /// Drive the queue against `ctx` until it empties or a frame waits.
    /// Once `error` is latched, every subsequent call short-circuits
    /// without touching `ctx` (§7 "Serialization errors are latched").
    pub fn run(&mut self, ctx: &mut S) -> Result<(), SerializationError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        loop {
            let Some(mut frame) = self.stack.pop_front() else {
                return Ok(());
            };
            let mut children = VecDeque::new();
            match (frame.step)(ctx, &mut children) {
                Ok(StepResult::Done) => {
                    self.splice_front(children);
                }
                Ok(StepResult::Continue) => {
                    self.stack.push_front(frame);
                    self.splice_front(children);
                }
                Ok(StepResult::Wait) => {
                    self.stack.push_front(frame);
                    self.splice_front(children);
                    return Ok(());
                }
                Err(e) => {
                    self.stack.clear();
                    self.error = Some(e.clone());
                    return Err(e);
                }
            }
        }
    }

    fn splice_front(&mut self, mut children: VecDeque<Frame<S>>) {
        while let Some(c) = children.pop_back() {
            self.stack.push_front(c);
        }
    }
}
