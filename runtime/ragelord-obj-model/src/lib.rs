//! Host object model for ragelord: the pinned layout of the host's
//! refcounted objects, a safe view of its tagged value slots, and the
//! resource table that maps resource ids to live resources.

pub mod layout;
pub mod resource_table;
pub mod value;

pub use layout::{
    Bucket, Decrement, HostLayout, KeyString, LayoutMismatch, RawResource, RawValue,
    RefcountError, RefcountHeader, ResourcePtr, SocketState, StructShape, verify_host_layout,
};
pub use resource_table::{ResourceId, ResourceTable, TableError};
pub use value::Value;
