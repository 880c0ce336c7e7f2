//! Dense generational object arena.
//!
//! An [`ObjectRef`] packs a slot index together with the slot's generation at allocation time.
//! Objects are never freed one at a time; [`Heap::clear`] drops them all and bumps every used slot's
//! generation, so references that outlive the objects resolve to nothing instead of aliasing
//! whatever is allocated into the slot next.
//!
//! Lookups are permissive: an absent or stale reference yields `None`, and callers decide what the
//! default is. Nothing here faults.

use std::collections::HashMap;

const INDEX_BITS: u32 = 24;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const MAX_SLOTS: usize = INDEX_MASK as usize;

/// Largest array the heap will allocate; bigger requests report exhaustion.
pub const MAX_ARRAY_LEN: usize = 1 << 24;

/// Reference to a heap object. `ObjectRef::NULL` (all bits zero) never resolves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectRef(u32);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Reinterpret raw register bits as a reference.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn new(index: usize, generation: u8) -> Self {
        Self(((generation as u32) << INDEX_BITS) | (index as u32 + 1))
    }

    fn index(self) -> Option<usize> {
        match self.0 & INDEX_MASK {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    fn generation(self) -> u8 {
        (self.0 >> INDEX_BITS) as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrayKind {
    Int,
    Wide,
    Object,
    Boolean,
    Byte,
    Char,
    Short,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HeapObject {
    Instance {
        type_idx: u32,
        fields: HashMap<u32, u64>,
    },
    Array {
        kind: ArrayKind,
        data: Vec<u64>,
    },
    /// Token standing in for a string constant from the method's string pool.
    String {
        string_idx: u32,
    },
    /// Token standing in for a class constant.
    Class {
        type_idx: u32,
    },
}

#[derive(Clone, Debug, Default)]
struct Slot {
    generation: u8,
    object: Option<HeapObject>,
}

#[derive(Clone, Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `object` in a free slot. Returns `None` once the index space is exhausted.
    pub fn alloc(&mut self, object: HeapObject) -> Option<ObjectRef> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return None;
                }
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.object = Some(object);
        self.live += 1;
        Some(ObjectRef::new(index, slot.generation))
    }

    pub fn alloc_instance(&mut self, type_idx: u32) -> Option<ObjectRef> {
        self.alloc(HeapObject::Instance {
            type_idx,
            fields: HashMap::new(),
        })
    }

    pub fn alloc_array(&mut self, kind: ArrayKind, len: usize) -> Option<ObjectRef> {
        if len > MAX_ARRAY_LEN {
            return None;
        }
        self.alloc(HeapObject::Array {
            kind,
            data: vec![0; len],
        })
    }

    pub fn alloc_array_from(&mut self, kind: ArrayKind, data: Vec<u64>) -> Option<ObjectRef> {
        self.alloc(HeapObject::Array { kind, data })
    }

    /// Drop every object. References handed out before stop resolving.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
            }
        }
        self.live = 0;
    }

    fn resolve(&self, obj: ObjectRef) -> Option<usize> {
        let index = obj.index()?;
        let slot = self.slots.get(index)?;
        (slot.object.is_some() && slot.generation == obj.generation()).then_some(index)
    }

    pub fn get(&self, obj: ObjectRef) -> Option<&HeapObject> {
        let index = self.resolve(obj)?;
        self.slots[index].object.as_ref()
    }

    pub fn get_mut(&mut self, obj: ObjectRef) -> Option<&mut HeapObject> {
        let index = self.resolve(obj)?;
        self.slots[index].object.as_mut()
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.resolve(obj).is_some()
    }

    pub fn array_len(&self, obj: ObjectRef) -> Option<u32> {
        match self.get(obj)? {
            HeapObject::Array { data, .. } => Some(data.len() as u32),
            _ => None,
        }
    }

    pub fn array_get(&self, obj: ObjectRef, index: i32) -> Option<u64> {
        let HeapObject::Array { data, .. } = self.get(obj)? else {
            return None;
        };
        usize::try_from(index)
            .ok()
            .and_then(|i| data.get(i))
            .copied()
    }

    /// Returns `false` (and stores nothing) when the reference or index does not resolve.
    pub fn array_set(&mut self, obj: ObjectRef, index: i32, value: u64) -> bool {
        let Some(HeapObject::Array { data, .. }) = self.get_mut(obj) else {
            return false;
        };
        match usize::try_from(index).ok().and_then(|i| data.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn field_get(&self, obj: ObjectRef, field: u32) -> Option<u64> {
        match self.get(obj)? {
            HeapObject::Instance { fields, .. } => Some(fields.get(&field).copied().unwrap_or(0)),
            _ => None,
        }
    }

    pub fn field_set(&mut self, obj: ObjectRef, field: u32, value: u64) -> bool {
        match self.get_mut(obj) {
            Some(HeapObject::Instance { fields, .. }) => {
                fields.insert(field, value);
                true
            }
            _ => false,
        }
    }
}
