//! specterx: user-mode process and kernel introspection over the Windows
//! native API layer.
//!
//! The crate talks to the undocumented system-call surface directly and
//! exposes raw facts for consumers to interpret:
//!
//! - Size-negotiated system, process, and object queries
//! - Callback-driven enumeration of kernel modules, namespace objects,
//!   processes, threads, and the modules of a foreign process (native and
//!   WOW64 loader views)
//! - Cross-process virtual memory read/write/allocate/protect/free
//! - Read-only mapping and header parsing of executable images
//! - Kernel driver service lifecycle (register, start, device open, stop,
//!   delete)
//!
//! The pure pieces (buffer negotiation, record traversal, loader walking
//! over an abstract memory source, image parsing) build and test on any
//! host; everything that actually crosses the system-call boundary is
//! Windows-only.

pub mod data;
#[cfg(windows)]
pub mod driver;
pub mod enumerate;
pub mod error;
#[cfg(windows)]
pub mod fileio;
pub mod image;
pub mod loader;
#[cfg(windows)]
pub mod memory;
#[cfg(windows)]
pub mod process;
pub mod query;
pub mod utils;

pub use enumerate::{Walk, WalkOutcome};
pub use error::{NtStatus, Result, SpecterError};
pub use loader::{ForeignModule, LoaderView, MemorySource};
