//! Pinned memory layout of the host runtime's managed objects.
//!
//! Every structure in this module is `#[repr(C)]` and matches the host build
//! byte for byte, so foreign code sharing the address space can read and
//! write these objects in place. Sizes and field offsets are asserted at
//! compile time on 64-bit targets and checked against the host's own report
//! at startup with [`verify_host_layout`].
//!
//! A [`RefcountHeader`] is only ever mutated through [`RefcountHeader::inc`],
//! [`RefcountHeader::dec`] and [`RefcountHeader::retag`]; its fields are not
//! reachable from outside this module.

use std::fmt;
use std::mem::{offset_of, size_of};
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU32, Ordering as AtomicOrdering};

use thiserror::Error;

pub const TYPE_UNDEF: u8 = 0;
pub const TYPE_NULL: u8 = 1;
pub const TYPE_FALSE: u8 = 2;
pub const TYPE_TRUE: u8 = 3;
pub const TYPE_LONG: u8 = 4;
pub const TYPE_DOUBLE: u8 = 5;
pub const TYPE_STRING: u8 = 6;
pub const TYPE_ARRAY: u8 = 7;
pub const TYPE_OBJECT: u8 = 8;
pub const TYPE_RESOURCE: u8 = 9;
pub const TYPE_REFERENCE: u8 = 10;

/// The `type_flags` byte sits directly above the type byte in `type_info`.
pub const TYPE_FLAGS_SHIFT: u32 = 8;
pub const TYPE_FLAG_REFCOUNTED: u32 = 1 << 0;
pub const TYPE_FLAG_COLLECTABLE: u32 = 1 << 1;

/// `type_info` of a value slot holding a resource pointer.
pub const TYPE_INFO_RESOURCE: u32 =
    TYPE_RESOURCE as u32 | (TYPE_FLAG_REFCOUNTED << TYPE_FLAGS_SHIFT);

/// Header type tag of every resource record.
pub const RESOURCE_TYPE_TAG: u32 = TYPE_RESOURCE as u32;
/// Header type tag of key strings.
pub const STRING_TYPE_TAG: u32 = TYPE_STRING as u32;

/// Terminates a bucket hash chain.
pub const INVALID_INDEX: u32 = u32::MAX;

const KEY_HASH_HIGH_BIT: u64 = 0x8000_0000_0000_0000;

// --- Refcount header ---

#[repr(C)]
pub struct RefcountHeader {
    count: AtomicU32,
    type_info: AtomicU32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decrement {
    /// Other owners remain; carries the new count.
    Retained(u32),
    /// The count went from one to zero. The caller runs the destructor.
    Released,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum RefcountError {
    #[error("refcount decrement on an object with no owners")]
    Underflow,
    #[error("refcount increment on an object that was already released")]
    Released,
    #[error("refcount overflow")]
    Overflow,
}

impl RefcountHeader {
    pub const fn new(type_tag: u32) -> Self {
        Self {
            count: AtomicU32::new(1),
            type_info: AtomicU32::new(type_tag),
        }
    }

    pub fn count(&self) -> u32 {
        self.count.load(AtomicOrdering::Acquire)
    }

    pub fn type_tag(&self) -> u32 {
        self.type_info.load(AtomicOrdering::Acquire)
    }

    /// Adds an owner and returns the new count.
    pub fn inc(&self) -> Result<u32, RefcountError> {
        self.count
            .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |count| {
                match count {
                    0 => None,
                    count => count.checked_add(1),
                }
            })
            .map(|prev| prev + 1)
            .map_err(|prev| {
                if prev == 0 {
                    RefcountError::Released
                } else {
                    RefcountError::Overflow
                }
            })
    }

    /// Drops an owner. Exactly one caller observes [`Decrement::Released`].
    pub fn dec(&self) -> Result<Decrement, RefcountError> {
        let prev = self
            .count
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| RefcountError::Underflow)?;
        if prev == 1 {
            Ok(Decrement::Released)
        } else {
            Ok(Decrement::Retained(prev - 1))
        }
    }

    /// Replaces the type tag, returning the previous one.
    pub fn retag(&self, type_tag: u32) -> u32 {
        self.type_info.swap(type_tag, AtomicOrdering::AcqRel)
    }
}

impl fmt::Debug for RefcountHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefcountHeader")
            .field("count", &self.count())
            .field("type_tag", &self.type_tag())
            .finish()
    }
}

// --- Tagged value slot ---

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WordPair {
    pub w1: u32,
    pub w2: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union ValueWord {
    pub lval: i64,
    pub dval: f64,
    pub ptr: *mut c_void,
    pub ww: WordPair,
}

/// A 16-byte tagged slot: payload word, `type_info`, and an auxiliary word
/// the owning container uses (bucket tables keep their hash chain there).
///
/// The active union alternative is determined by the type byte alone. Use
/// [`RawValue::get`] / [`RawValue::set`] from [`crate::value`] rather than
/// reading the union directly.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct RawValue {
    word: ValueWord,
    type_info: u32,
    aux: u32,
}

impl RawValue {
    pub const UNDEF: Self = Self {
        word: ValueWord { lval: 0 },
        type_info: TYPE_UNDEF as u32,
        aux: 0,
    };

    pub(crate) const fn from_parts(word: ValueWord, type_info: u32) -> Self {
        Self {
            word,
            type_info,
            aux: 0,
        }
    }

    pub(crate) fn word(&self) -> ValueWord {
        self.word
    }

    /// Writes tag and payload together; `aux` belongs to the container and
    /// is left alone.
    pub(crate) fn store(&mut self, word: ValueWord, type_info: u32) {
        *self = Self {
            word,
            type_info,
            aux: self.aux,
        };
    }

    pub fn type_byte(&self) -> u8 {
        (self.type_info & 0xff) as u8
    }

    pub fn type_flags(&self) -> u8 {
        ((self.type_info >> TYPE_FLAGS_SHIFT) & 0xff) as u8
    }

    pub fn type_info(&self) -> u32 {
        self.type_info
    }

    pub fn is_undef(&self) -> bool {
        self.type_byte() == TYPE_UNDEF
    }

    pub fn is_refcounted(&self) -> bool {
        (self.type_flags() as u32 & TYPE_FLAG_REFCOUNTED) != 0
    }

    pub fn aux(&self) -> u32 {
        self.aux
    }

    pub fn set_aux(&mut self, aux: u32) {
        self.aux = aux;
    }

    /// Raw payload bits regardless of the active alternative.
    pub fn word_bits(&self) -> u64 {
        // SAFETY: every alternative is 8 bytes of plain data.
        unsafe { self.word.lval as u64 }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        // SAFETY: RawValue is 16 bytes of plain data with no padding.
        unsafe { std::mem::transmute::<Self, [u8; 16]>(*self) }
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        // SAFETY: any bit pattern is a valid RawValue; pointers read from it
        // are never dereferenced without a live resource behind them.
        unsafe { std::mem::transmute::<[u8; 16], Self>(bytes) }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        Self::UNDEF
    }
}

impl fmt::Debug for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawValue")
            .field("type_info", &format_args!("{:#x}", self.type_info))
            .field("word", &format_args!("{:#018x}", self.word_bits()))
            .field("aux", &self.aux)
            .finish()
    }
}

// --- Key strings and buckets ---

/// Hash of a string key (times-33 with the high bit forced on, so string
/// hashes never collide with small integer ids).
pub fn hash_key(key: &str) -> u64 {
    let mut hash: u64 = 5381;
    for &byte in key.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash | KEY_HASH_HIGH_BIT
}

#[repr(C)]
pub struct KeyString {
    gc: RefcountHeader,
    h: u64,
    len: usize,
    val: *mut u8,
}

impl KeyString {
    pub fn new(text: &str) -> Self {
        let bytes: Box<[u8]> = text.as_bytes().into();
        let len = bytes.len();
        Self {
            gc: RefcountHeader::new(STRING_TYPE_TAG),
            h: hash_key(text),
            len,
            val: Box::into_raw(bytes).cast::<u8>(),
        }
    }

    pub fn header(&self) -> &RefcountHeader {
        &self.gc
    }

    pub fn hash(&self) -> u64 {
        self.h
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: `val`/`len` come from a boxed copy of a `&str` owned by self.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(self.val, self.len)) }
    }
}

impl Drop for KeyString {
    fn drop(&mut self) {
        // SAFETY: reconstructs the box leaked in `new`.
        unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.val, self.len))) };
    }
}

impl fmt::Debug for KeyString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyString").field(&self.as_str()).finish()
    }
}

/// One slot of an associative container. Integer-keyed buckets carry the
/// id in `h` and a null key; string-keyed buckets own their key.
#[repr(C)]
pub struct Bucket {
    val: RawValue,
    h: u64,
    key: *mut KeyString,
}

impl Bucket {
    pub fn indexed(h: u64, val: RawValue) -> Self {
        Self {
            val,
            h,
            key: ptr::null_mut(),
        }
    }

    pub fn keyed(key: &str, val: RawValue) -> Self {
        let key = Box::new(KeyString::new(key));
        Self {
            val,
            h: key.hash(),
            key: Box::into_raw(key),
        }
    }

    pub fn hash(&self) -> u64 {
        self.h
    }

    pub fn key(&self) -> Option<&str> {
        if self.key.is_null() {
            return None;
        }
        // SAFETY: a non-null key is owned by this bucket until drop.
        Some(unsafe { (*self.key).as_str() })
    }

    pub fn val(&self) -> &RawValue {
        &self.val
    }

    pub fn val_mut(&mut self) -> &mut RawValue {
        &mut self.val
    }

    pub fn is_tombstone(&self) -> bool {
        self.val.is_undef()
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if !self.key.is_null() {
            // SAFETY: the key was leaked from a Box in `keyed`.
            unsafe { drop(Box::from_raw(self.key)) };
        }
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("val", &self.val)
            .field("h", &self.h)
            .field("key", &self.key())
            .finish()
    }
}

// --- Resources ---

/// A host resource record. `handle` is the resource-table id (0 until
/// registered), `kind` the resource kind id, `ptr` the kind-specific native
/// state. `handle` and `ptr` are atomics with the layout of `i64` and a raw
/// pointer, so a published record is only ever mutated through `&self`.
#[repr(C)]
pub struct RawResource {
    gc: RefcountHeader,
    handle: AtomicI64,
    kind: c_int,
    ptr: AtomicPtr<c_void>,
}

impl RawResource {
    pub fn new(kind: c_int) -> Self {
        Self {
            gc: RefcountHeader::new(RESOURCE_TYPE_TAG),
            handle: AtomicI64::new(0),
            kind,
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn header(&self) -> &RefcountHeader {
        &self.gc
    }

    pub fn handle(&self) -> i64 {
        self.handle.load(AtomicOrdering::Acquire)
    }

    pub fn kind(&self) -> c_int {
        self.kind
    }

    pub fn native_ptr(&self) -> *mut c_void {
        self.ptr.load(AtomicOrdering::Acquire)
    }

    pub fn set_handle(&self, handle: i64) {
        self.handle.store(handle, AtomicOrdering::Release);
    }

    /// Installs native state, returning whatever was there before.
    pub fn install_native(&self, native: *mut c_void) -> *mut c_void {
        self.ptr.swap(native, AtomicOrdering::AcqRel)
    }

    pub fn take_native(&self) -> *mut c_void {
        self.ptr.swap(ptr::null_mut(), AtomicOrdering::AcqRel)
    }
}

impl fmt::Debug for RawResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawResource")
            .field("gc", &self.gc)
            .field("handle", &self.handle())
            .field("kind", &self.kind)
            .field("ptr", &self.native_ptr())
            .finish()
    }
}

/// Native state behind socket and stream resources. `family` holds the
/// address family (the host calls this field `type`); `stream` caches an
/// exported stream value and stays undef until someone exports one.
#[repr(C)]
#[derive(Debug)]
pub struct SocketState {
    pub bsd_socket: c_int,
    pub family: c_int,
    pub error: c_int,
    pub blocking: c_int,
    pub stream: RawValue,
}

impl SocketState {
    pub fn new(bsd_socket: c_int, family: c_int, error: c_int, blocking: bool) -> Self {
        Self {
            bsd_socket,
            family,
            error,
            blocking: blocking as c_int,
            stream: RawValue::UNDEF,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking != 0
    }
}

/// Address of a [`RawResource`].
///
/// Holding a `ResourcePtr` grants nothing: every operation that reads
/// through it is `unsafe` and requires the caller to own a reference.
///
/// ```compile_fail,E0133
/// use ragelord_obj_model::{RawResource, ResourcePtr};
///
/// let record = Box::into_raw(Box::new(RawResource::new(1)));
/// let _ = ResourcePtr::from_raw(record);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourcePtr(NonNull<RawResource>);

// The header count is atomic and every other field is written before the
// resource is published to other threads.
unsafe impl Send for ResourcePtr {}
unsafe impl Sync for ResourcePtr {}

impl ResourcePtr {
    /// Heap-allocates a fresh resource record with count 1.
    pub fn allocate(kind: c_int) -> Self {
        Self(NonNull::from(Box::leak(Box::new(RawResource::new(kind)))))
    }

    /// # Safety
    /// `ptr` must be null or point to a record obtained from
    /// [`ResourcePtr::allocate`] that has not been freed.
    pub unsafe fn from_raw(ptr: *mut RawResource) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Rebuilds the pointer stored in a value slot. The result is only an
    /// address; nothing is read through it here.
    pub(crate) fn from_slot_word(ptr: *mut RawResource) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut RawResource {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The resource must still have at least one owner for the whole of `'a`.
    pub unsafe fn as_ref<'a>(self) -> &'a RawResource {
        // SAFETY: upheld by the caller.
        unsafe { self.0.as_ref() }
    }

    /// # Safety
    /// Must be called once, after the count reached zero, by the party that
    /// observed [`Decrement::Released`] (or on a never-shared allocation).
    pub unsafe fn free(self) {
        // SAFETY: the record was leaked from a Box in `allocate`.
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

// --- Layout contract ---

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(size_of::<RefcountHeader>() == 8);
    assert!(offset_of!(RefcountHeader, count) == 0);
    assert!(offset_of!(RefcountHeader, type_info) == 4);

    assert!(size_of::<ValueWord>() == 8);
    assert!(size_of::<RawValue>() == 16);
    assert!(offset_of!(RawValue, word) == 0);
    assert!(offset_of!(RawValue, type_info) == 8);
    assert!(offset_of!(RawValue, aux) == 12);

    assert!(size_of::<Bucket>() == 32);
    assert!(offset_of!(Bucket, val) == 0);
    assert!(offset_of!(Bucket, h) == 16);
    assert!(offset_of!(Bucket, key) == 24);

    assert!(size_of::<RawResource>() == 32);
    assert!(offset_of!(RawResource, gc) == 0);
    assert!(offset_of!(RawResource, handle) == 8);
    assert!(offset_of!(RawResource, kind) == 16);
    assert!(offset_of!(RawResource, ptr) == 24);

    assert!(size_of::<SocketState>() == 32);
    assert!(offset_of!(SocketState, bsd_socket) == 0);
    assert!(offset_of!(SocketState, family) == 4);
    assert!(offset_of!(SocketState, error) == 8);
    assert!(offset_of!(SocketState, blocking) == 12);
    assert!(offset_of!(SocketState, stream) == 16);
};

pub const REFCOUNT_HEADER: &str = "refcount_header";
pub const VALUE_SLOT: &str = "value_slot";
pub const BUCKET: &str = "bucket";
pub const RESOURCE: &str = "resource";
pub const SOCKET_STATE: &str = "socket_state";

/// Size and field offsets of one structure, as reported by a host build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructShape {
    pub name: String,
    pub size: usize,
    pub fields: Vec<(String, usize)>,
}

impl StructShape {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        Self {
            name: name.into(),
            size,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, offset: usize) -> Self {
        self.fields.push((name.into(), offset));
        self
    }

    pub fn offset_of(&self, field: &str) -> Option<usize> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, offset)| *offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostLayout {
    pub structs: Vec<StructShape>,
}

impl HostLayout {
    /// The layout this build was compiled against.
    pub fn compiled() -> Self {
        Self {
            structs: vec![
                StructShape::new(REFCOUNT_HEADER, size_of::<RefcountHeader>())
                    .field("count", offset_of!(RefcountHeader, count))
                    .field("type_info", offset_of!(RefcountHeader, type_info)),
                StructShape::new(VALUE_SLOT, size_of::<RawValue>())
                    .field("value", offset_of!(RawValue, word))
                    .field("type_info", offset_of!(RawValue, type_info))
                    .field("aux", offset_of!(RawValue, aux)),
                StructShape::new(BUCKET, size_of::<Bucket>())
                    .field("val", offset_of!(Bucket, val))
                    .field("h", offset_of!(Bucket, h))
                    .field("key", offset_of!(Bucket, key)),
                StructShape::new(RESOURCE, size_of::<RawResource>())
                    .field("gc", offset_of!(RawResource, gc))
                    .field("handle", offset_of!(RawResource, handle))
                    .field("type", offset_of!(RawResource, kind))
                    .field("ptr", offset_of!(RawResource, ptr)),
                StructShape::new(SOCKET_STATE, size_of::<SocketState>())
                    .field("bsd_socket", offset_of!(SocketState, bsd_socket))
                    .field("type", offset_of!(SocketState, family))
                    .field("error", offset_of!(SocketState, error))
                    .field("blocking", offset_of!(SocketState, blocking))
                    .field("zstream", offset_of!(SocketState, stream)),
            ],
        }
    }

    pub fn find(&self, name: &str) -> Option<&StructShape> {
        self.structs.iter().find(|shape| shape.name == name)
    }

    /// Replaces (or adds) the shape with the same name.
    pub fn with_struct(mut self, shape: StructShape) -> Self {
        self.structs.retain(|existing| existing.name != shape.name);
        self.structs.push(shape);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutMismatch {
    #[error("host layout does not describe `{0}`")]
    MissingStructure(String),
    #[error("host layout does not describe `{structure}.{field}`")]
    MissingField { structure: String, field: String },
    #[error("`{structure}` is {found} bytes in the host, this build expects {expected}")]
    Size {
        structure: String,
        expected: usize,
        found: usize,
    },
    #[error("`{structure}.{field}` is at offset {found} in the host, this build expects {expected}")]
    Offset {
        structure: String,
        field: String,
        expected: usize,
        found: usize,
    },
}

/// Checks a host-reported layout against [`HostLayout::compiled`]. Extra
/// structures or fields in the host report are ignored.
pub fn verify_host_layout(host: &HostLayout) -> Result<(), LayoutMismatch> {
    for expected in HostLayout::compiled().structs {
        let Some(found) = host.find(&expected.name) else {
            return Err(LayoutMismatch::MissingStructure(expected.name));
        };
        if found.size != expected.size {
            return Err(LayoutMismatch::Size {
                structure: expected.name,
                expected: expected.size,
                found: found.size,
            });
        }
        for (field, offset) in &expected.fields {
            match found.offset_of(field) {
                None => {
                    return Err(LayoutMismatch::MissingField {
                        structure: expected.name.clone(),
                        field: field.clone(),
                    });
                }
                Some(found_offset) if found_offset != *offset => {
                    return Err(LayoutMismatch::Offset {
                        structure: expected.name.clone(),
                        field: field.clone(),
                        expected: *offset,
                        found: found_offset,
                    });
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}
