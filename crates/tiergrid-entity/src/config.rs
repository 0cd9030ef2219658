//! Typed configuration keys.
//!
//! A `ConfigKey<T>` is an immutable definition: name, description, optional
//! default and mutability. Values bound on an entity are stored as JSON and
//! checked against the key's type when bound.

use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// When a configuration key may be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Only before the entity starts running its behaviour.
    PreStart,
    /// At any time.
    Mutable,
}

/// Untyped definition of a configuration key, as declared on an entity.
#[derive(Clone)]
pub struct ConfigKeyDef {
    pub name: Cow<'static, str>,
    pub description: Cow<'static, str>,
    pub default: Option<Value>,
    pub mutability: Mutability,
    accepts: fn(&Value) -> bool,
}

impl ConfigKeyDef {
    /// Whether a value has the key's type.
    pub fn accepts(&self, value: &Value) -> bool {
        (self.accepts)(value)
    }
}

impl fmt::Debug for ConfigKeyDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigKeyDef")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("mutability", &self.mutability)
            .finish()
    }
}

/// A typed, named configuration slot.
#[derive(Clone)]
pub struct ConfigKey<T> {
    def: ConfigKeyDef,
    _marker: PhantomData<fn() -> T>,
}

fn accepts<T: DeserializeOwned>(value: &Value) -> bool {
    T::deserialize(value).is_ok()
}

impl<T: Serialize + DeserializeOwned> ConfigKey<T> {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            def: ConfigKeyDef {
                name: name.into(),
                description: description.into(),
                default: None,
                mutability: Mutability::PreStart,
                accepts: accepts::<T>,
            },
            _marker: PhantomData,
        }
    }

    pub fn with_default(mut self, default: T) -> Self {
        self.def.default = serde_json::to_value(default).ok();
        self
    }

    /// Allow the key to be changed while the entity runs.
    pub fn mutable(mut self) -> Self {
        self.def.mutability = Mutability::Mutable;
        self
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ConfigKeyDef {
        &self.def
    }

    /// The declared default, decoded.
    pub fn default_value(&self) -> Option<T> {
        self.def
            .default
            .as_ref()
            .and_then(|v| T::deserialize(v).ok())
    }
}

impl<T> fmt::Debug for ConfigKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigKey({})", self.def.name)
    }
}
