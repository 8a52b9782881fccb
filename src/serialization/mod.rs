//! Resumable binary serialization engine (§4.7) and its type map (§4.8).
//!
//! The engine is a small stack machine: encoding/decoding one value pushes
//! one or more `Frame`s, each a step closure that either finishes (`Done`),
//! asks to be re-run immediately (`Continue`, used to move to the next
//! container element), or asks for control back because the caller's buffer
//! ran out (`Wait`). `run()` drives the stack until it empties or a frame
//! waits, so the same `Serializer`/`Deserializer` can be fed a byte window
//! at a time across many calls — exactly the shape a non-blocking socket
//! write/read loop needs.

mod binary;
mod engine;
mod runnable;
pub mod typemap;

pub mod deserializer;
pub mod serializer;

pub use deserializer::Deserializer;
pub use runnable::StepResult;
pub use serializer::Serializer;
pub use typemap::TypeMap;
