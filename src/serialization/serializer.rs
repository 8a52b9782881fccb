//! Encoder half of the engine (§4.7).

use std::any::Any;
use std::collections::VecDeque;
use std::io::Read;

use crate::config::Limits;
use crate::error::SerializationError;

use super::binary::{BOOL_FALSE, BOOL_TRUE};
use super::engine::Engine;
use super::runnable::{Frame, StepResult};
use super::typemap::TypeMap;

/// Output half of a `Frame`'s context: a bounded byte window the step
/// writes into, one `run()` call at a time.
pub(crate) trait WriteSink: Send {
    fn remaining(&self) -> usize;
    /// Write as much of `bytes` as fits; returns the count actually
    /// written (`<= bytes.len()`).
    fn write(&mut self, bytes: &[u8]) -> usize;
}

struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> WriteSink for SliceWriter<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.buf[self.pos .. self.pos + n].copy_from_slice(&bytes[.. n]);
        self.pos += n;
        n
    }
}

type WFrame = Frame<dyn WriteSink>;
type WQueue = VecDeque<WFrame>;

fn frame_cross_integer(name: &'static str, v: u64) -> WFrame {
    let mut encoded = Vec::with_capacity(9);
    super::binary::encode_cross_integer(v, &mut encoded);
    let mut written = 0usize;
    Frame::new(name, move |ctx: &mut dyn WriteSink, _children: &mut WQueue| {
        if ctx.remaining() < encoded.len() - written {
            return Ok(StepResult::Wait);
        }
        written += ctx.write(&encoded[written ..]);
        Ok(StepResult::Done)
    })
}

fn frame_bool(v: bool) -> WFrame {
    let byte = if v { BOOL_TRUE } else { BOOL_FALSE };
    Frame::new("bool", move |ctx: &mut dyn WriteSink, _children: &mut WQueue| {
        if ctx.remaining() < 1 {
            return Ok(StepResult::Wait);
        }
        ctx.write(&[byte]);
        Ok(StepResult::Done)
    })
}

enum Stage {
    Header(usize),
    Body,
}

/// length-prefix then chunked raw-byte payload, used by bytes/string/blob.
fn frame_length_prefixed(
    name: &'static str,
    payload: Vec<u8>,
    limit: usize,
) -> Result<WFrame, SerializationError> {
    if payload.len() > limit {
        return Err(limit_error_for(name));
    }
    let mut header = Vec::with_capacity(9);
    super::binary::encode_cross_integer(payload.len() as u64, &mut header);
    let mut stage = Stage::Header(0);
    let mut cursor = 0usize;
    Ok(Frame::new(name, move |ctx: &mut dyn WriteSink, _children: &mut WQueue| {
        loop {
            match stage {
                Stage::Header(written) => {
                    if ctx.remaining() == 0 {
                        return Ok(StepResult::Wait);
                    }
                    let n = ctx.write(&header[written ..]);
                    if written + n < header.len() {
                        stage = Stage::Header(written + n);
                        return Ok(StepResult::Wait);
                    }
                    stage = Stage::Body;
                }
                Stage::Body => {
                    if cursor >= payload.len() {
                        return Ok(StepResult::Done);
                    }
                    if ctx.remaining() == 0 {
                        return Ok(StepResult::Wait);
                    }
                    let n = ctx.write(&payload[cursor ..]);
                    cursor += n;
                    if cursor >= payload.len() {
                        return Ok(StepResult::Done);
                    }
                    return Ok(StepResult::Wait);
                }
            }
        }
    }))
}

fn limit_error_for(name: &'static str) -> SerializationError {
    match name {
        "string" => SerializationError::LimitString,
        "blob" => SerializationError::LimitBlob,
        _ => SerializationError::LimitContainer,
    }
}

/// Encoder half of the resumable engine.
pub struct Serializer {
    engine: Engine<dyn WriteSink>,
    limits: Limits,
    protocol_version: u32,
}

impl Serializer {
    pub fn new(limits: Limits) -> Self {
        Serializer {
            engine: Engine::new(),
            limits,
            protocol_version: 1,
        }
    }

    fn scratch(&self) -> Serializer {
        Serializer {
            engine: Engine::new(),
            limits: self.limits,
            protocol_version: self.protocol_version,
        }
    }

    /// Latched error from a previous `run()`, if any.
    pub fn error(&self) -> Option<&SerializationError> {
        self.engine.error()
    }

    pub fn is_idle(&self) -> bool {
        self.engine.is_idle()
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn set_protocol_version(&mut self, version: u32) {
        self.protocol_version = version;
    }

    /// Drive the stack, writing into `buf`. Returns the number of bytes
    /// produced (may be less than `buf.len()` if the stack emptied).
    pub fn run(&mut self, buf: &mut [u8]) -> Result<usize, SerializationError> {
        let mut sink = SliceWriter { buf, pos: 0 };
        self.engine.run(&mut sink)?;
        Ok(sink.pos)
    }

    pub fn push_u64(&mut self, v: u64) {
        self.engine.push(frame_cross_integer("u64", v));
    }

    pub fn push_u32(&mut self, v: u32) {
        self.engine.push(frame_cross_integer("u32", v as u64));
    }

    pub fn push_i64(&mut self, v: i64) {
        // zig-zag so negative values still fit the cross-integer's
        // byte-count-prefixed unsigned encoding compactly.
        let zz = ((v << 1) ^ (v >> 63)) as u64;
        self.engine.push(frame_cross_integer("i64", zz));
    }

    pub fn push_bool(&mut self, v: bool) {
        self.engine.push(frame_bool(v));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), SerializationError> {
        self.engine.push(frame_length_prefixed("blob", bytes.to_vec(), self.limits.max_blob)?);
        Ok(())
    }

    pub fn push_str(&mut self, s: &str) -> Result<(), SerializationError> {
        self.engine
            .push(frame_length_prefixed("string", s.as_bytes().to_vec(), self.limits.max_string)?);
        Ok(())
    }

    pub fn push_bitset(&mut self, bits: &[bool]) -> Result<(), SerializationError> {
        let mut packed = vec![0u8; (bits.len() + 7) / 8];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        let mut header = Vec::with_capacity(9);
        super::binary::encode_cross_integer(bits.len() as u64, &mut header);
        header.extend_from_slice(&packed);
        self.engine.push(frame_length_prefixed("bitset", header, usize::MAX)?);
        Ok(())
    }

    /// Encode `items.len()` as a cross-integer count, then one element per
    /// pushed child frame built by `encode_one`. Resumable: if `run()`
    /// returns mid-iteration, the remaining items stay queued.
    pub fn push_container<T>(
        &mut self,
        items: Vec<T>,
        limits: &Limits,
        mut encode_one: impl FnMut(T, &mut Serializer) + Send + 'static,
    ) -> Result<(), SerializationError>
    where
        T: Send + 'static,
    {
        if items.len() > limits.max_container {
            return Err(SerializationError::LimitContainer);
        }
        self.push_u64(items.len() as u64);
        let mut iter = items.into_iter();
        let limits = *limits;
        let version = self.protocol_version;
        self.engine.push(Frame::new("container", move |_ctx: &mut dyn WriteSink, children: &mut WQueue| {
            match iter.next() {
                Some(item) => {
                    let mut scratch = Serializer {
                        engine: Engine::new(),
                        limits,
                        protocol_version: version,
                    };
                    encode_one(item, &mut scratch);
                    scratch.engine.drain_into(children);
                    Ok(StepResult::Continue)
                }
                None => Ok(StepResult::Done),
            }
        }));
        Ok(())
    }

    /// Encode `reader`'s contents as a chunked stream (§4.7/§6): repeated
    /// `(u16 len, len bytes)` records terminated by a zero-length record.
    /// `on_progress(bytes_so_far, done, name)` fires once per chunk written;
    /// the running total is checked against `max_stream` as it grows.
    pub fn push_stream(
        &mut self,
        name: &'static str,
        mut reader: impl Read + Send + 'static,
        mut on_progress: impl FnMut(u64, bool, &str) + Send + 'static,
    ) {
        enum Stage {
            ReadChunk,
            WriteFrame { buf: Vec<u8>, pos: usize, terminator: bool },
        }
        let max_stream = self.limits.max_stream;
        let mut stage = Stage::ReadChunk;
        let mut total: u64 = 0;
        self.engine.push(Frame::new(name, move |ctx: &mut dyn WriteSink, _children: &mut WQueue| loop {
            match &mut stage {
                Stage::ReadChunk => {
                    let mut chunk = vec![0u8; 4096];
                    let n = match reader.read(&mut chunk) {
                        Ok(n) => n,
                        // The stream source is caller-supplied (e.g. a file);
                        // there is no dedicated I/O variant in this latched
                        // error type, so a read failure is reported the same
                        // way an over-budget stream is.
                        Err(_) => return Err(SerializationError::LimitStream),
                    };
                    if n == 0 {
                        stage = Stage::WriteFrame {
                            buf: 0u16.to_le_bytes().to_vec(),
                            pos: 0,
                            terminator: true,
                        };
                        continue;
                    }
                    total += n as u64;
                    if total > max_stream {
                        return Err(SerializationError::LimitStream);
                    }
                    let mut framed = Vec::with_capacity(2 + n);
                    framed.extend_from_slice(&(n as u16).to_le_bytes());
                    framed.extend_from_slice(&chunk[.. n]);
                    stage = Stage::WriteFrame {
                        buf: framed,
                        pos: 0,
                        terminator: false,
                    };
                }
                Stage::WriteFrame { buf, pos, terminator } => {
                    if ctx.remaining() == 0 {
                        return Ok(StepResult::Wait);
                    }
                    *pos += ctx.write(&buf[*pos ..]);
                    if *pos < buf.len() {
                        return Ok(StepResult::Wait);
                    }
                    let done = *terminator;
                    on_progress(total, done, name);
                    if done {
                        return Ok(StepResult::Done);
                    }
                    stage = Stage::ReadChunk;
                }
            }
        }));
    }

    /// Emit `value`'s wire type-id via `type_map`, then its encoding as a
    /// length-prefixed blob (so an unrecognized id can still be skipped by
    /// a peer that only shares the id space, not every type).
    pub fn push_polymorphic(
        &mut self,
        type_map: &TypeMap,
        value: Box<dyn Any + Send>,
    ) -> Result<(), SerializationError> {
        let id = type_map
            .wire_id_for(value.as_ref())
            .ok_or(SerializationError::NoCast)?;
        let store = type_map.store_fn_for_id(id).ok_or(SerializationError::NoType { id })?;
        self.push_u64(id);

        let mut scratch = self.scratch();
        store(value.as_ref(), &mut scratch);
        let mut blob = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = scratch.run(&mut chunk)?;
            blob.extend_from_slice(&chunk[.. n]);
            if scratch.is_idle() {
                break;
            }
        }
        self.push_bytes(&blob)
    }
}
