//! Embedder-tunable knobs, grounded on `wasmtime::Config`'s role: a
//! plain settings struct threaded into `Compartment::create` and
//! `instantiate_module` rather than read from globals.

/// Per-compartment/per-instance feature switches and limits (§6.3).
#[derive(Clone, Debug)]
pub struct Config {
    /// Proposal feature flags. Disabled features still validate (parsing
    /// is out of scope here) but the runtime refuses to instantiate a
    /// module that uses a disabled feature's object kinds.
    pub enable_exception_handling: bool,
    pub enable_simd: bool,
    pub enable_reference_types: bool,
    pub enable_bulk_memory: bool,
    pub enable_threads: bool,
    pub enable_multi_memory: bool,
    pub enable_memory64: bool,

    /// log2 alignment of a compartment's runtime-data reservation; see
    /// `SPEC_FULL.md` §3 for why `31` (2 GiB) was chosen over the
    /// original implementation's 32-bit (4 GiB) default.
    pub compartment_reserved_bytes_log2: u32,

    pub max_memories_per_compartment: u32,
    pub max_tables_per_compartment: u32,
    pub max_contexts_per_compartment: u32,

    /// Bytes of virtual address space reserved per linear memory (§4.4);
    /// actual pages are committed lazily on `memory.grow`.
    pub memory_reservation_bytes: u64,
    /// Elements of virtual address space reserved per table (§4.5).
    pub table_reservation_elements: u64,

    /// Default per-compartment resource quota caps, used when a
    /// compartment is created without an explicit [`crate::resource_quota::ResourceQuota`].
    pub default_max_memory_pages: u64,
    pub default_max_table_elements: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_exception_handling: true,
            enable_simd: true,
            enable_reference_types: true,
            enable_bulk_memory: true,
            enable_threads: true,
            enable_multi_memory: true,
            enable_memory64: false,

            compartment_reserved_bytes_log2: 31,

            max_memories_per_compartment: 255,
            max_tables_per_compartment: 256,
            max_contexts_per_compartment: 1024,

            memory_reservation_bytes: 8 << 30,
            table_reservation_elements: 1 << 32,

            default_max_memory_pages: 1 << 18, // 16 TiB worth of 64 KiB pages, i.e. "unset"
            default_max_table_elements: 1 << 20,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compartment_reserved_bytes(&self) -> u64 {
        1u64 << self.compartment_reserved_bytes_log2
    }
}
