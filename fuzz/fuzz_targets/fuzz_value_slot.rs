#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use ragelord_obj_model::{RawValue, Value};

#[derive(Debug, Arbitrary)]
struct Slot {
    bytes: [u8; 16],
    overwrite: Option<(u8, i64)>,
}

fuzz_target!(|slot: Slot| {
    let mut raw = RawValue::from_bytes(slot.bytes);
    let aux = raw.aux();
    let value = raw.get();

    // Resource pointers read from fuzz bytes are never dereferenced; only
    // the tag and bits are compared.
    if !matches!(value, Value::Resource(_)) {
        let mut copy = RawValue::UNDEF;
        copy.set(value);
        assert_eq!(copy.type_byte(), raw.type_byte());
        if let Value::Opaque { .. } = value {
            assert_eq!(copy.type_info(), raw.type_info());
            assert_eq!(copy.word_bits(), raw.word_bits());
        }
    }

    if let Some((tag, bits)) = slot.overwrite {
        let next = match tag % 4 {
            0 => Value::Null,
            1 => Value::Bool(bits & 1 == 1),
            2 => Value::Long(bits),
            _ => Value::Double(f64::from_bits(bits as u64)),
        };
        raw.set(next);
        assert_eq!(raw.aux(), aux);
        match (raw.get(), next) {
            (Value::Double(a), Value::Double(b)) => assert_eq!(a.to_bits(), b.to_bits()),
            (got, want) => assert_eq!(got, want),
        }
    }
});
