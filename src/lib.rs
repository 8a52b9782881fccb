//! SolidFrame's asynchronous I/O reactor core: per-thread reactors
//! multiplexing cooperatively-scheduled active objects over non-blocking
//! sockets, a cross-thread scheduler that places and wakes them, and a
//! resumable binary serialization engine for the messages that flow over
//! those sockets.
//!
//! The crate carries no CLI and parses no configuration files or
//! environment variables; embedding applications construct [`config`]
//! structs directly and drive a [`scheduler::Scheduler`].

pub mod clock;
pub mod config;
pub mod error;
pub mod notifier;
pub mod object;
pub mod reactor;
pub mod scheduler;
pub mod serialization;
pub mod socket;
pub mod timer;
pub mod wake;

pub use clock::{Clock, Instant, MonotonicClock};
pub use config::{Limits, ReactorConfig, SchedulerConfig};
pub use error::{CoreError, SerializationError};
pub use object::{ActiveObject, Disposition, Events, SocketStub};
pub use scheduler::{ObjectUid, Scheduler};
pub use serialization::{Deserializer, Serializer, TypeMap};
