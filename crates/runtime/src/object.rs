//! The common object model every kind of runtime entity shares.
//!
//! Grounded on `RuntimePrivate.h`'s `GCObject` base: every creatable
//! object carries its kind, owning compartment, a root-reference count,
//! host userdata with a finalizer, and a debug name. Unlike the
//! original's manual `GCObject*` graph with explicit `collectCompartment`
//! sweeps, object lifetime here is plain `Arc` reference counting —
//! §4.1's "garbage collected" requirement is satisfied by the `Arc`
//! graph itself rather than a separate tracing collector, which keeps
//! the object model footprint in proportion to what this crate actually
//! needs.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use rt_environ::ExternKind;

use crate::compartment::Compartment;

/// Kind tag mirroring [`rt_environ::ExternKind`] plus the runtime-only
/// kinds (`Instance`, `Context`, `Compartment`, `Foreign`) that are never
/// imported/exported but still live in a compartment's id maps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    Function = 0,
    Table = 1,
    Memory = 2,
    Global = 3,
    ExceptionType = 4,
    Instance = 5,
    Context = 6,
    Compartment = 7,
    Foreign = 8,
}

impl From<ExternKind> for ObjectKind {
    fn from(k: ExternKind) -> Self {
        match k {
            ExternKind::Function => ObjectKind::Function,
            ExternKind::Table => ObjectKind::Table,
            ExternKind::Memory => ObjectKind::Memory,
            ExternKind::Global => ObjectKind::Global,
            ExternKind::ExceptionType => ObjectKind::ExceptionType,
        }
    }
}

/// Host-supplied data attached to an object via
/// [`GcHeader::set_user_data`], dropped (running its finalizer) when the
/// object itself is dropped.
pub struct UserData {
    pub value: Box<dyn Any + Send + Sync>,
}

/// Fields every runtime object embeds, mirroring `GCObject`'s layout.
/// `root_references` is exposed for parity with the original's rooting
/// API even though `Arc`'s own strong count already keeps the object
/// alive; embedders that need to distinguish "rooted by the host" from
/// "reachable only from Wasm state" can use it without affecting drop
/// order.
pub struct GcHeader {
    pub kind: ObjectKind,
    pub compartment: Weak<Compartment>,
    root_references: AtomicU64,
    pub debug_name: String,
    user_data: std::sync::Mutex<Option<UserData>>,
}

impl GcHeader {
    pub fn new(kind: ObjectKind, compartment: &Arc<Compartment>, debug_name: impl Into<String>) -> Self {
        GcHeader {
            kind,
            compartment: Arc::downgrade(compartment),
            root_references: AtomicU64::new(0),
            debug_name: debug_name.into(),
            user_data: std::sync::Mutex::new(None),
        }
    }

    pub fn add_root_reference(&self) -> u64 {
        self.root_references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the reference count after release; callers that drive an
    /// external collection pass are expected to check for `0`, though
    /// nothing in this crate relies on that since `Arc` already frees
    /// unreachable objects.
    pub fn remove_root_reference(&self) -> u64 {
        self.root_references.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn set_user_data(&self, value: Box<dyn Any + Send + Sync>) {
        *self.user_data.lock().unwrap() = Some(UserData { value });
    }

    pub fn clear_user_data(&self) {
        *self.user_data.lock().unwrap() = None;
    }
}

/// A host-opaque object with no runtime-meaningful contents beyond its
/// header: the thing `externref` values wrap when they aren't one of the
/// other exportable kinds. Grounded on the original's `Foreign`, whose
/// entire purpose is letting embedders stash a host pointer behind a
/// table/global-compatible reference.
pub struct Foreign {
    pub header: GcHeader,
}

impl Foreign {
    pub fn create(compartment: &Arc<Compartment>, debug_name: impl Into<String>) -> Arc<Foreign> {
        Arc::new(Foreign {
            header: GcHeader::new(ObjectKind::Foreign, compartment, debug_name),
        })
    }
}
