//! The embedder-facing value representation, distinct from the raw
//! [`UntaggedValue`] bytes the invoke boundary marshals through.

use std::sync::Arc;

use rt_environ::{RefType, ValType};

use crate::function::Function;
use crate::object::Foreign;
use crate::vmcontext::UntaggedValue;

#[derive(Clone)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128([u8; 16]),
    FuncRef(Option<Arc<Function>>),
    ExternRef(Option<Arc<Foreign>>),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::FuncRef(_) => ValType::Ref(RefType::Func),
            Value::ExternRef(_) => ValType::Ref(RefType::Extern),
        }
    }

    /// Encodes into the 16-byte slot the invoke boundary marshals
    /// through. A reference value's pointer carries one implicit strong
    /// reference into the slot; the matching [`Value::decode`] call must
    /// run exactly once per encoded slot to reclaim it.
    pub fn encode(&self) -> UntaggedValue {
        match self {
            Value::I32(v) => UntaggedValue::from_i32(*v),
            Value::I64(v) => UntaggedValue::from_i64(*v),
            Value::F32(v) => UntaggedValue::from_f32(*v),
            Value::F64(v) => UntaggedValue::from_f64(*v),
            Value::V128(v) => UntaggedValue::from_v128(*v),
            Value::FuncRef(None) | Value::ExternRef(None) => UntaggedValue::ZERO,
            Value::FuncRef(Some(f)) => UntaggedValue::from_i64(Arc::into_raw(f.clone()) as i64),
            Value::ExternRef(Some(f)) => UntaggedValue::from_i64(Arc::into_raw(f.clone()) as i64),
        }
    }

    /// Decodes a slot encoded by [`Value::encode`] for the given
    /// expected type. Callers must not call this more than once per
    /// encoded reference value (see `encode`'s doc).
    ///
    /// # Safety
    /// `raw` must either be `UntaggedValue::ZERO` (null reference) or a
    /// value produced by `encode`-ing a `Value` of the same ref kind,
    /// not yet decoded.
    pub unsafe fn decode(raw: UntaggedValue, ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(raw.as_i32()),
            ValType::I64 => Value::I64(raw.as_i64()),
            ValType::F32 => Value::F32(raw.as_f32()),
            ValType::F64 => Value::F64(raw.as_f64()),
            ValType::V128 => Value::V128(raw.as_v128()),
            ValType::Ref(RefType::Func) => {
                let addr = raw.as_i64();
                if addr == 0 {
                    Value::FuncRef(None)
                } else {
                    Value::FuncRef(Some(Arc::from_raw(addr as *const Function)))
                }
            }
            ValType::Ref(RefType::Extern) => {
                let addr = raw.as_i64();
                if addr == 0 {
                    Value::ExternRef(None)
                } else {
                    Value::ExternRef(Some(Arc::from_raw(addr as *const Foreign)))
                }
            }
        }
    }
}
