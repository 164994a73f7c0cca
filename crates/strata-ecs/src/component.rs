//! Component keys and the per-world key registry.
//!
//! Every component type gets a [`ComponentKey`] the first time a [`World`]
//! sees it. Keys are dense `u32` values, totally ordered, and are the unit of
//! every set operation in the filter engine.
//!
//! [`World`]: crate::world::World

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use crate::storage::{ComponentStore, StagedStorage};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Marker for types that can be stored as components.
///
/// Any plain value type qualifies. Zero-sized types are tags: they only record
/// membership and carry no payload.
pub trait Component: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Component for T {}

// ---------------------------------------------------------------------------
// ComponentKey
// ---------------------------------------------------------------------------

/// Opaque, comparable identity of a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey(pub(crate) u32);

impl ComponentKey {
    /// The key as an index into per-key tables.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentKey({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentDescriptor
// ---------------------------------------------------------------------------

/// Type-level description of a component, usable before a key exists.
///
/// Queries and command buffers are built from descriptors; the world turns
/// them into keys (registering the type on first sight).
#[derive(Clone, Copy)]
pub struct ComponentDescriptor {
    type_id: TypeId,
    type_name: &'static str,
    size: usize,
    align: usize,
    make_store: fn(ComponentKey, &str) -> Box<dyn ComponentStore>,
}

impl ComponentDescriptor {
    /// Describe component type `T`.
    pub fn of<T: Component>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            make_store: |key, name| Box::new(StagedStorage::<T>::new(key, name)),
        }
    }

    /// Rust `TypeId` of the component.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the component.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the component is a zero-sized tag.
    pub fn is_tag(&self) -> bool {
        self.size == 0
    }

    /// Build an empty store for this component type.
    pub fn make_store(&self, key: ComponentKey, name: &str) -> Box<dyn ComponentStore> {
        (self.make_store)(key, name)
    }
}

impl PartialEq for ComponentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ComponentDescriptor {}

impl fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Key assigned at registration time.
    pub key: ComponentKey,
    /// Display name (the Rust type name unless registered under another name).
    pub name: String,
    /// `std::mem::size_of::<T>()`, zero for tags.
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
}

impl ComponentInfo {
    /// Whether the component is a zero-sized tag.
    pub fn is_tag(&self) -> bool {
        self.size == 0
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Maps Rust types to [`ComponentKey`]s and their metadata.
///
/// A type is registered at most once; registering it again returns the
/// existing key.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentKey>,
    by_name: HashMap<String, ComponentKey>,
    /// Indexed by `ComponentKey.0`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the described type, optionally under an explicit name.
    ///
    /// Returns `(key, newly_registered)`. An explicit name already used by a
    /// different type is rejected with [`EcsError::DuplicateName`], and so is
    /// an explicit name for a type already registered under another name.
    /// Default names that happen to collide get the key appended.
    pub fn register(
        &mut self,
        descriptor: &ComponentDescriptor,
        name: Option<&str>,
    ) -> Result<(ComponentKey, bool), EcsError> {
        if let Some(&existing) = self.by_type.get(&descriptor.type_id) {
            return match name {
                Some(explicit) if explicit != self.name(existing) => Err(EcsError::DuplicateName {
                    name: explicit.to_owned(),
                }),
                _ => Ok((existing, false)),
            };
        }
        let Some(explicit) = name else {
            return Ok(self.register_default(descriptor));
        };
        if self.by_name.contains_key(explicit) {
            return Err(EcsError::DuplicateName {
                name: explicit.to_owned(),
            });
        }
        Ok((self.insert(descriptor, explicit.to_owned()), true))
    }

    /// Register the described type under its Rust type name.
    ///
    /// Never fails: a default name that collides gets the key appended.
    pub fn register_default(&mut self, descriptor: &ComponentDescriptor) -> (ComponentKey, bool) {
        if let Some(&existing) = self.by_type.get(&descriptor.type_id) {
            return (existing, false);
        }
        let name = if self.by_name.contains_key(descriptor.type_name) {
            format!("{}#{}", descriptor.type_name, self.infos.len())
        } else {
            descriptor.type_name.to_owned()
        };
        (self.insert(descriptor, name), true)
    }

    fn insert(&mut self, descriptor: &ComponentDescriptor, name: String) -> ComponentKey {
        let key = ComponentKey(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            key,
            name: name.clone(),
            size: descriptor.size,
            align: descriptor.align,
            type_id: descriptor.type_id,
        });
        self.by_type.insert(descriptor.type_id, key);
        self.by_name.insert(name, key);
        key
    }

    /// Look up a key by Rust `TypeId`.
    pub fn lookup(&self, type_id: TypeId) -> Option<ComponentKey> {
        self.by_type.get(&type_id).copied()
    }

    /// Look up the key of `T`.
    pub fn key_of<T: 'static>(&self) -> Option<ComponentKey> {
        self.lookup(TypeId::of::<T>())
    }

    /// Look up a key by registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentKey> {
        self.by_name.get(name).copied()
    }

    /// Metadata for a key.
    pub fn info(&self, key: ComponentKey) -> Option<&ComponentInfo> {
        self.infos.get(key.index())
    }

    /// Display name for a key, `"<unknown>"` when unregistered.
    pub fn name(&self, key: ComponentKey) -> &str {
        self.info(key).map(|i| i.name.as_str()).unwrap_or("<unknown>")
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether no component type has been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Registered names, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
