//! String objects and the intern table. A string instance holds a shared
//! character array plus offset and length, so substrings alias the parent's
//! characters. The intern table maps Rust strings to canonical heap
//! strings; its values are collector roots.

use ahash::AHashMap;

use crate::heap::{ARRAY_ELEMS, Heap, INSTANCE_FIELDS};
use crate::value::{HeapRef, Value};

/// Field cell order of `java/lang/String`, fixed by the bootstrap.
pub const STRING_F_CHARS: u32 = 0;
pub const STRING_F_OFFSET: u32 = 1;
pub const STRING_F_LENGTH: u32 = 2;
pub const STRING_FIELD_CELLS: u16 = 3;

#[derive(Debug, Default)]
pub struct Interns {
    map: AHashMap<String, Value>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, text: &str) -> Option<Value> {
        self.map.get(text).copied()
    }

    pub fn insert(&mut self, text: String, string: Value) {
        self.map.insert(text, string);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn for_each_slot_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        for v in self.map.values_mut() {
            f(v);
        }
    }
}

/// Fill an already-allocated string instance. `chars` must reference a
/// primitive char array.
pub fn init_string(heap: &mut Heap, string: HeapRef, chars: Value, offset: u32, length: u32) {
    heap.set_value(string, INSTANCE_FIELDS + STRING_F_CHARS, chars);
    heap.set_value(
        string,
        INSTANCE_FIELDS + STRING_F_OFFSET,
        Value::from_int(offset as i64),
    );
    heap.set_value(
        string,
        INSTANCE_FIELDS + STRING_F_LENGTH,
        Value::from_int(length as i64),
    );
}

pub fn string_length(heap: &Heap, string: HeapRef) -> u32 {
    heap.value_at(string, INSTANCE_FIELDS + STRING_F_LENGTH).as_int() as u32
}

/// Decode a heap string back to Rust text (diagnostics, natives, tests).
pub fn read_string(heap: &Heap, string: HeapRef) -> String {
    let chars = heap
        .value_at(string, INSTANCE_FIELDS + STRING_F_CHARS)
        .expect_ref();
    let offset = heap.value_at(string, INSTANCE_FIELDS + STRING_F_OFFSET).as_int() as u32;
    let length = string_length(heap, string);
    let mut units = Vec::with_capacity(length as usize);
    for i in 0..length {
        units.push(heap.get(chars, ARRAY_ELEMS + offset + i) as u16);
    }
    String::from_utf16_lossy(&units)
}
