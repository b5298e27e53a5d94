// Licensed under the Apache-2.0 license

//! Shared-memory IPC between the application processor and the sensor
//! hub, and supervision of the hub's lifecycle.

pub mod alive;
pub mod data;
pub mod dump;
pub mod error;
pub mod evt;
pub mod fault;
pub mod layout;
pub mod lifecycle;
pub mod logbuf;
pub mod mailbox;
pub mod persist;
pub mod platform;
pub mod session;
pub mod shmem;
pub mod transport;
pub mod wait;

#[cfg(test)]
mod testutil;

pub use error::{
    DataError, EvtError, ImageError, LayoutError, LifecycleError, MemError, PlatformError,
    TimeoutError, TransportError,
};
pub use evt::{EventCode, EventDescriptor};
pub use fault::FaultKind;
pub use layout::{attach, negotiate, BootDescriptor, LayoutMap};
pub use lifecycle::{HubState, Lifecycle, LifecycleStats, Token};
pub use mailbox::{Endpoint, IrqHandler, Mailbox, MailboxBus, ScratchSlot};
pub use persist::BootMode;
pub use platform::{FirmwareLoader, HubPlatform, Symbol};
pub use session::{Direction, IpcSession};
pub use shmem::{MemRegion, SharedMemory};
pub use transport::{ChannelHandle, Transport};
