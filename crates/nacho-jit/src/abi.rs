//! Calling convention between the engine and compiled units.
//!
//! A compiled unit is a function `entry(window_ptr: i32) -> ret` over a single linear memory.
//! `window_ptr` points at the register window: slot `i` (8 bytes, little-endian) backs IR local
//! `i`. `I32`/`F32`/`Ref` locals use the low 4 bytes of their slot. Locals are loaded from the
//! window on entry and written back by every `RETURN`; a unit that traps writes nothing back.
//!
//! Layout (bytes):
//! - `[WINDOW_PTR, WINDOW_PTR + MAX_WINDOW_SLOTS * SLOT_BYTES)`: register window
//! - `[SCRATCH_BASE, MEMORY_PAGES * 64KiB)`: scratch memory addressed by IR `LOAD*`/`STORE*`
//!
//! A unit must not rely on scratch contents left by an earlier call or by another unit.

pub const SLOT_BYTES: u32 = 8;
pub const MAX_WINDOW_SLOTS: u32 = 256;
pub const WINDOW_PTR: u32 = 0;
pub const SCRATCH_BASE: u32 = WINDOW_PTR + MAX_WINDOW_SLOTS * SLOT_BYTES;
pub const MEMORY_PAGES: u32 = 1;
pub const WASM_PAGE_SIZE: u32 = 64 * 1024;
pub const MEMORY_BYTES: u32 = MEMORY_PAGES * WASM_PAGE_SIZE;

pub const EXPORT_ENTRY: &str = "entry";

pub const IMPORT_MODULE: &str = "env";
pub const IMPORT_MEMORY: &str = "memory";

/// `(type_idx: i32) -> ref`
pub const IMPORT_NEW_OBJECT: &str = "new_object";
/// `(len: i32) -> ref`; traps on a negative length.
pub const IMPORT_NEW_ARRAY: &str = "new_array";
/// `(array: ref) -> i32`; absent arrays have length 0.
pub const IMPORT_ARRAY_LENGTH: &str = "array_length";
/// `(array: ref, index: i32) -> i32`; absent arrays and out-of-range indices read 0.
pub const IMPORT_ARRAY_GET: &str = "array_get";
/// `(array: ref, index: i32, value: i32)`; writes to absent arrays or out-of-range indices are dropped.
pub const IMPORT_ARRAY_SET: &str = "array_set";
/// `(object: ref, field: i32) -> i32`
pub const IMPORT_GET_FIELD: &str = "get_field";
/// `(object: ref, field: i32, value: i32)`
pub const IMPORT_SET_FIELD: &str = "set_field";

const _: () = {
    assert!(SCRATCH_BASE < MEMORY_BYTES);
    assert!(WINDOW_PTR % SLOT_BYTES == 0);
};
