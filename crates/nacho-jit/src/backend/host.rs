//! Object-model operations shared by every backend.
//!
//! Both the wasm host imports and the IR interpreter route `NEW_*`, `ARRAY_*` and field ops
//! through these, so compiled units see one heap semantics regardless of backend. Accesses through
//! absent references or out-of-range indices are permissive: reads yield 0, writes are dropped.

use nacho_core::{ArrayKind, Heap, ObjectRef};

use super::ExecError;

pub(crate) fn new_object(heap: &mut Heap, type_idx: i32) -> Result<i32, ExecError> {
    heap.alloc_instance(type_idx as u32)
        .map(|r| r.bits() as i32)
        .ok_or(ExecError::HeapExhausted)
}

pub(crate) fn new_array(heap: &mut Heap, len: i32) -> Result<i32, ExecError> {
    let len_usize = usize::try_from(len).map_err(|_| ExecError::NegativeArrayLength(len))?;
    heap.alloc_array(ArrayKind::Int, len_usize)
        .map(|r| r.bits() as i32)
        .ok_or(ExecError::HeapExhausted)
}

pub(crate) fn array_length(heap: &Heap, array: i32) -> i32 {
    heap.array_len(obj(array)).unwrap_or(0) as i32
}

pub(crate) fn array_get(heap: &Heap, array: i32, index: i32) -> i32 {
    heap.array_get(obj(array), index).unwrap_or(0) as i32
}

pub(crate) fn array_set(heap: &mut Heap, array: i32, index: i32, value: i32) {
    heap.array_set(obj(array), index, value as u32 as u64);
}

pub(crate) fn get_field(heap: &Heap, object: i32, field: i32) -> i32 {
    heap.field_get(obj(object), field as u32).unwrap_or(0) as i32
}

pub(crate) fn set_field(heap: &mut Heap, object: i32, field: i32, value: i32) {
    heap.field_set(obj(object), field as u32, value as u32 as u64);
}

fn obj(bits: i32) -> ObjectRef {
    ObjectRef::from_bits(bits as u32)
}
