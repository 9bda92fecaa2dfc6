//! Heterogeneous per-message storage keyed by type. Plugins stash values
//! here to hand data to later stages without coupling their types.
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

type AnyVal = Box<dyn Any + Send + Sync>;

/// a map holding at most one value per type
#[derive(Default)]
pub struct TypeMap {
    map: HashMap<TypeId, AnyVal>,
}

impl fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeMap").field("len", &self.map.len()).finish()
    }
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// insert a value, returning the previous value of this type if any
    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
        self.map
            .insert(TypeId::of::<T>(), Box::new(val))
            .and_then(|old| old.downcast().ok())
            .map(|boxed| *boxed)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|val| val.downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|val| val.downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|val| val.downcast().ok())
            .map(|boxed| *boxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn insert_get_remove() {
        let mut map = TypeMap::new();
        assert!(map.insert(Marker(1)).is_none());
        assert_eq!(map.insert(Marker(2)), Some(Marker(1)));
        assert_eq!(map.get::<Marker>(), Some(&Marker(2)));
        map.get_mut::<Marker>().unwrap().0 = 3;
        assert_eq!(map.remove::<Marker>(), Some(Marker(3)));
        assert!(map.get::<Marker>().is_none());
    }
}
