/// Errors produced while validating, loading, or querying a PE image.
///
/// These mirror the error kinds a disk-loaded module would surface through
/// `GetLastError` after `LoadLibrary`/`GetProcAddress`, but are carried as
/// typed values instead of a thread-local error code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer is too short to contain a header it claims to have, or an
    /// offset derived from a header runs past the end of the buffer.
    #[error("PE buffer is truncated or an offset runs out of bounds")]
    InvalidData,
    /// DOS/NT signature, machine type, or section alignment failed
    /// validation before any memory was touched.
    #[error("not a valid PE image for this host (bad signature, machine, or alignment)")]
    BadFormat,
    /// Reserving or committing the image's virtual address range failed.
    #[error("failed to reserve or commit the image's virtual memory region")]
    OutOfMemory,
    /// An import descriptor named a module the resolver could not load.
    #[error("an imported module could not be loaded")]
    ModuleNotFound,
    /// A thunk, or a direct `get_proc_address` lookup, resolved to nothing.
    #[error("an imported or requested symbol could not be resolved")]
    SymbolNotFound,
    /// The DLL entry point returned `FALSE` on `DLL_PROCESS_ATTACH`.
    #[error("DllMain returned failure on process attach")]
    DllInitFailed,
    /// A page-protection change failed during section finalization.
    #[error("failed to apply final page protection to a section")]
    ProtectFailed,
    /// A resource directory lookup failed; see [`ResourceError`] for which
    /// level of the type/name/language tree came up empty.
    #[error("resource lookup failed: {0}")]
    Resource(#[from] ResourceError),
}

/// Which level of the resource directory's type → name → language tree
/// failed to produce a match, or whether the data entry itself was absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// No entry for the requested resource type.
    #[error("resource type not found")]
    TypeNotFound,
    /// The type was found but no entry for the requested name.
    #[error("resource name not found")]
    NameNotFound,
    /// Type and name were found but no entry for the requested language,
    /// and there were no id entries to fall back to.
    #[error("resource language not found")]
    LangNotFound,
    /// The resource directory itself is empty (no data directory entry).
    #[error("resource data directory not present")]
    DataNotFound,
}
