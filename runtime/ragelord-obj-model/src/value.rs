use crate::layout::{
    RawValue, ResourcePtr, TYPE_DOUBLE, TYPE_FALSE, TYPE_INFO_RESOURCE, TYPE_LONG, TYPE_NULL,
    TYPE_RESOURCE, TYPE_TRUE, TYPE_UNDEF, ValueWord,
};

/// Safe view of a [`RawValue`].
///
/// Slot kinds this crate does not model (strings, arrays, objects,
/// references) come back as [`Value::Opaque`] with their bits untouched. An
/// `Opaque` whose type byte names a modeled kind reads back as that kind.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Undef,
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Resource(ResourcePtr),
    Opaque { type_info: u32, bits: u64 },
}

impl Value {
    pub fn from_bool(value: bool) -> Self {
        Self::Bool(value)
    }

    pub fn from_long(value: i64) -> Self {
        Self::Long(value)
    }

    pub fn from_double(value: f64) -> Self {
        Self::Double(value)
    }

    pub fn from_resource(ptr: ResourcePtr) -> Self {
        Self::Resource(ptr)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Self::Undef)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_resource(&self) -> Option<ResourcePtr> {
        match self {
            Self::Resource(ptr) => Some(*ptr),
            _ => None,
        }
    }

    fn encode(self) -> (ValueWord, u32) {
        match self {
            Self::Undef => (ValueWord { lval: 0 }, TYPE_UNDEF as u32),
            Self::Null => (ValueWord { lval: 0 }, TYPE_NULL as u32),
            Self::Bool(false) => (ValueWord { lval: 0 }, TYPE_FALSE as u32),
            Self::Bool(true) => (ValueWord { lval: 0 }, TYPE_TRUE as u32),
            Self::Long(value) => (ValueWord { lval: value }, TYPE_LONG as u32),
            Self::Double(value) => (ValueWord { dval: value }, TYPE_DOUBLE as u32),
            Self::Resource(ptr) => (
                ValueWord {
                    ptr: ptr.as_ptr().cast(),
                },
                TYPE_INFO_RESOURCE,
            ),
            Self::Opaque { type_info, bits } => (ValueWord { lval: bits as i64 }, type_info),
        }
    }
}

impl RawValue {
    pub fn get(&self) -> Value {
        let word = self.word();
        // SAFETY: each arm reads the alternative its type byte selects; all
        // alternatives are plain data.
        unsafe {
            match self.type_byte() {
                TYPE_UNDEF => Value::Undef,
                TYPE_NULL => Value::Null,
                TYPE_FALSE => Value::Bool(false),
                TYPE_TRUE => Value::Bool(true),
                TYPE_LONG => Value::Long(word.lval),
                TYPE_DOUBLE => Value::Double(word.dval),
                TYPE_RESOURCE => match ResourcePtr::from_slot_word(word.ptr.cast()) {
                    Some(ptr) => Value::Resource(ptr),
                    None => self.opaque(),
                },
                _ => self.opaque(),
            }
        }
    }

    /// Replaces tag and payload in one assignment.
    pub fn set(&mut self, value: Value) {
        let (word, type_info) = value.encode();
        self.store(word, type_info);
    }

    fn opaque(&self) -> Value {
        Value::Opaque {
            type_info: self.type_info(),
            bits: self.word_bits(),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        let (word, type_info) = value.encode();
        RawValue::from_parts(word, type_info)
    }
}

impl From<&RawValue> for Value {
    fn from(raw: &RawValue) -> Self {
        raw.get()
    }
}
