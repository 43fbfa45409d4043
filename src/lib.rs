//! # memload: an in-memory PE/COFF loader.
//!
//! `memload` loads, relocates, and runs a Windows DLL or EXE straight out of
//! a byte buffer — no temporary file, no `LoadLibrary` against disk. It is a
//! Rust-native take on the MemoryModule approach: parse the headers, reserve
//! address space, copy sections into place, patch base relocations, bind
//! imports, fix up section protection, run TLS callbacks, and dispatch the
//! entry point.
//!
//! The pipeline is split into small, independently testable stages rather
//! than one long function, each named for what it does:
//!
//! - [`pe`] — Header Validator: parses and sanity-checks the DOS/COFF/
//!   optional headers and section table.
//! - [`loader`] — Image Layout Planner, Image Allocator, and overall
//!   orchestration; [`loader::load`] is the crate's main entry point.
//! - [`sections`] — Section Materializer: copies section bytes into the
//!   committed image.
//! - [`relocate`] — Relocator: applies the base relocation table.
//! - [`imports`] — Import Binder: resolves and patches the import address
//!   table.
//! - [`finalize`] — Section Finalizer: narrows each page down to its final
//!   protection.
//! - [`tls`] — TLS Invoker: runs TLS callbacks.
//! - [`entry`] — Entry-Point Dispatcher: resolves and calls `DllMain`/`main`.
//! - [`exports`] — Export Resolver: the in-memory equivalent of
//!   `GetProcAddress` against the loaded image's own exports.
//! - [`resource`] — Resource Directory Walker: `FindResource`/`LoadString`
//!   equivalents over the image's resource tree.
//!
//! Two external collaborators the host OS normally owns are modeled as
//! traits so the pipeline can be exercised without touching the real OS:
//! [`vm::VirtualMemoryService`] (reserve/commit/protect/free) and
//! [`resolver::ModuleResolver`] (load/resolve/free other modules' imports).

#![warn(missing_docs)]

/// COFF file header definitions and helper functions.
pub mod coff;
/// Optional header definitions and helper functions.
pub mod optional;
/// Section header definitions and helper functions.
pub mod section;
/// Header Validator: parses the full set of PE/COFF headers.
pub mod pe;

/// Crate-wide error type.
pub mod error;
/// Bounds-checked view over a loaded image's committed memory.
pub mod image;
/// Base relocation type codes and which ones this crate applies.
pub mod relocation;
/// The external virtual-memory collaborator.
pub mod vm;
/// The external module-resolution collaborator.
pub mod resolver;
/// A loaded image and its lifetime management.
pub mod module;

/// Section Materializer: copies section bytes into a committed image.
pub mod sections;
/// Relocator: applies the base relocation table.
pub mod relocate;
/// Import Binder: resolves and patches the import address table.
pub mod imports;
/// Section Finalizer: applies final per-page protection.
pub mod finalize;
/// TLS Invoker: walks and calls the TLS callback array.
pub mod tls;
/// Entry-Point Dispatcher: resolves and calls an image's entry point.
pub mod entry;
/// Export Resolver: looks up a loaded image's own exports.
pub mod exports;
/// Resource Directory Walker: `FindResource`/`LoadString` equivalents.
pub mod resource;

/// Image Layout Planner, Image Allocator, and pipeline orchestration.
pub mod loader;

#[cfg(test)]
mod testutil;

pub use error::Error;
pub use loader::load;
pub use module::{Module, ProcKey};
pub use resource::{ResourceData, ResourceId};
