//! Type map (§4.8): associates a wire id with a concrete Rust type so
//! polymorphic pointers can be encoded/decoded generically.
//!
//! The original engine casts between base and derived C++ types through a
//! registered function pointer; Rust's `std::any::Any` plus a factory
//! closure gives the same capability without unsafe casts, at the cost of
//! requiring the destination type to be named at the `register_cast` call
//! site (exactly as the original requires the cast to be registered before
//! any pointer of that base type can be decoded).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SerializationError;

use super::serializer::Serializer;

pub type StoreFn = Arc<dyn Fn(&(dyn Any + Send), &mut Serializer) + Send + Sync>;
/// Decodes a fully-buffered payload blob into a concrete instance. Taking a
/// plain `&[u8]` rather than a `Deserializer` keeps polymorphic decode
/// self-contained: the blob's length was already established by its
/// length-prefixed wire framing, so the concrete type's own decode loop can
/// run to completion against it without needing to suspend back into the
/// outer resumable stack.
pub type LoadFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, SerializationError> + Send + Sync>;
/// Casts a freshly constructed concrete value into the caller-visible base
/// representation (here: just confirms/forwards, since `Box<dyn Any + Send>`
/// already erases to the common denominator every registered type shares).
pub type CastFn = Arc<dyn Fn(Box<dyn Any + Send>) -> Box<dyn Any + Send> + Send + Sync>;

struct TypeStub {
    wire_id: u64,
    type_id: TypeId,
    store: StoreFn,
    load: LoadFn,
    factory: Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
}

/// Registry mapping a wire id to a concrete Rust type's (store, load,
/// factory) triple, and concrete types to casts into a requested base.
#[derive(Default)]
pub struct TypeMap {
    by_id: HashMap<u64, TypeStub>,
    by_type: HashMap<TypeId, u64>,
    casts: HashMap<(TypeId, TypeId), CastFn>,
    null_id: Option<u64>,
}

impl TypeMap {
    pub fn new() -> Self {
        TypeMap::default()
    }

    /// Register `T` under `id`. `store`/`load` are the type's own
    /// encode/decode steps; `factory` constructs a default instance for
    /// decode before `load` populates it.
    pub fn register_type<T: Any + Send + 'static>(
        &mut self,
        id: u64,
        store: StoreFn,
        load: LoadFn,
        factory: Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>,
    ) {
        let type_id = TypeId::of::<T>();
        self.by_id.insert(
            id,
            TypeStub {
                wire_id: id,
                type_id,
                store,
                load,
                factory,
            },
        );
        self.by_type.insert(type_id, id);
    }

    /// Register a cast from `Derived` to `Base`, required before a pointer
    /// declared as `Base` can be decoded into a `Derived` instance.
    pub fn register_cast<Derived: Any + Send + 'static, Base: Any + Send + 'static>(&mut self, cast: CastFn) {
        self.casts.insert((TypeId::of::<Derived>(), TypeId::of::<Base>()), cast);
    }

    /// Designate `id` as the null-encoding id (an empty polymorphic
    /// payload decodes to "no value" rather than `NoType`).
    pub fn set_null(&mut self, id: u64) {
        self.null_id = Some(id);
    }

    pub fn null_id(&self) -> Option<u64> {
        self.null_id
    }

    pub fn wire_id_for(&self, value: &(dyn Any + Send)) -> Option<u64> {
        self.by_type.get(&value.type_id()).copied()
    }

    pub(crate) fn store_fn_for_id(&self, id: u64) -> Option<StoreFn> {
        self.by_id.get(&id).map(|s| s.store.clone())
    }

    pub(crate) fn load_fn_for_id(&self, id: u64) -> Option<LoadFn> {
        self.by_id.get(&id).map(|s| s.load.clone())
    }

    /// The concrete Rust type registered under `id`, for looking up a cast
    /// into the base type a polymorphic pointer was declared with.
    pub(crate) fn type_id_for_id(&self, id: u64) -> Option<TypeId> {
        self.by_id.get(&id).map(|s| s.type_id)
    }

    /// Construct a fresh boxed instance for `id`'s registered type via its
    /// factory. Polymorphic decode calls this before `load` populates the
    /// instance, mirroring the original engine's construct-then-load split
    /// (§4.7) and doubling as the existence check for `id`.
    pub fn construct(&self, id: u64) -> Result<Box<dyn Any + Send>, SerializationError> {
        self.by_id
            .get(&id)
            .map(|s| (s.factory)())
            .ok_or(SerializationError::NoType { id })
    }

    pub fn cast(
        &self,
        derived: TypeId,
        base: TypeId,
        value: Box<dyn Any + Send>,
    ) -> Result<Box<dyn Any + Send>, SerializationError> {
        self.casts
            .get(&(derived, base))
            .map(|c| c(value))
            .ok_or(SerializationError::NoCast)
    }

    /// Every id registered so far, for diagnostics.
    pub fn registered_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Widget {
        id: u32,
    }

    #[test]
    fn register_and_look_up_roundtrip() {
        let mut map = TypeMap::new();
        map.register_type::<Widget>(
            7,
            Arc::new(|v, ser| {
                let w = v.downcast_ref::<Widget>().unwrap();
                ser.push_u32(w.id);
            }),
            Arc::new(|_blob: &[u8]| Ok(Box::new(Widget { id: 0 }) as Box<dyn Any + Send>)),
            Arc::new(|| Box::new(Widget { id: 0 })),
        );
        let w: Box<dyn Any + Send> = Box::new(Widget { id: 42 });
        assert_eq!(map.wire_id_for(w.as_ref()), Some(7));
        assert_eq!(map.registered_ids(), vec![7]);
    }

    #[test]
    fn unregistered_id_is_no_type() {
        let map = TypeMap::new();
        assert_eq!(map.construct(99).unwrap_err(), SerializationError::NoType { id: 99 });
    }

    #[test]
    fn missing_cast_is_no_cast() {
        let map = TypeMap::new();
        let v: Box<dyn Any + Send> = Box::new(Widget { id: 1 });
        let err = map.cast(TypeId::of::<Widget>(), TypeId::of::<Widget>(), v).unwrap_err();
        assert_eq!(err, SerializationError::NoCast);
    }
}
