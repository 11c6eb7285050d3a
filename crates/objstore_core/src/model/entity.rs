//! Entity kinds, attribute schema and the kind registry.
//!
//! # Invariants
//! - Kind and attribute names match `^[A-Za-z_][A-Za-z0-9_]*$`.
//! - A kind is registered at most once per registry.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

static IDENTIFIER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern must compile")
});

/// Returns whether `value` is usable as a kind or attribute name.
pub fn is_valid_identifier(value: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(value)
}

/// Registry and schema errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityError {
    InvalidKindName(String),
    InvalidAttributeName { kind: String, attribute: String },
    DuplicateAttribute { kind: String, attribute: String },
    DuplicateKind(String),
    UnknownEntity(String),
}

impl Display for EntityError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKindName(name) => write!(f, "entity kind name is invalid: `{name}`"),
            Self::InvalidAttributeName { kind, attribute } => {
                write!(f, "attribute name `{attribute}` on `{kind}` is invalid")
            }
            Self::DuplicateAttribute { kind, attribute } => {
                write!(f, "attribute `{attribute}` declared twice on `{kind}`")
            }
            Self::DuplicateKind(name) => write!(f, "entity kind already registered: {name}"),
            Self::UnknownEntity(name) => write!(f, "entity kind not registered: {name}"),
        }
    }
}

impl Error for EntityError {}

/// Validated entity kind name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKind(String);

impl EntityKind {
    pub fn new(name: impl Into<String>) -> Result<Self, EntityError> {
        let name = name.into();
        if !is_valid_identifier(&name) {
            return Err(EntityError::InvalidKindName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage type of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Bool,
    Integer,
    Real,
    Text,
}

impl AttributeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Text => "text",
        }
    }
}

/// Declared attribute of an entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDescriptor {
    pub name: String,
    pub value_type: AttributeType,
    /// Required attributes must be non-null when a record is committed.
    pub optional: bool,
}

impl AttributeDescriptor {
    pub fn required(name: impl Into<String>, value_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            value_type,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, value_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            value_type,
            optional: true,
        }
    }
}

/// Schema of one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    kind: EntityKind,
    attributes: Vec<AttributeDescriptor>,
}

impl EntityDescriptor {
    /// Builds a descriptor after validating every name.
    pub fn new(
        name: impl Into<String>,
        attributes: Vec<AttributeDescriptor>,
    ) -> Result<Self, EntityError> {
        let kind = EntityKind::new(name)?;
        for (index, attribute) in attributes.iter().enumerate() {
            if !is_valid_identifier(&attribute.name) {
                return Err(EntityError::InvalidAttributeName {
                    kind: kind.to_string(),
                    attribute: attribute.name.clone(),
                });
            }
            if attributes[..index]
                .iter()
                .any(|earlier| earlier.name == attribute.name)
            {
                return Err(EntityError::DuplicateAttribute {
                    kind: kind.to_string(),
                    attribute: attribute.name.clone(),
                });
            }
        }
        Ok(Self { kind, attributes })
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn attributes(&self) -> &[AttributeDescriptor] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|attribute| attribute.name == name)
    }
}

/// Compile-time binding between a Rust type and a stored entity kind.
///
/// Typed `Store` methods route through `ENTITY_NAME`, so callers never name
/// a kind by string or cast a record.
pub trait Entity {
    const ENTITY_NAME: &'static str;

    fn attributes() -> Vec<AttributeDescriptor>;
}

/// Kind-name keyed schema registry.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: BTreeMap<String, Arc<EntityDescriptor>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<(), EntityError> {
        let name = descriptor.kind().as_str().to_string();
        if self.entities.contains_key(&name) {
            return Err(EntityError::DuplicateKind(name));
        }
        self.entities.insert(name, Arc::new(descriptor));
        Ok(())
    }

    /// Registers the schema declared by an `Entity` type.
    pub fn register_entity<E: Entity>(&mut self) -> Result<(), EntityError> {
        self.register(EntityDescriptor::new(E::ENTITY_NAME, E::attributes())?)
    }

    /// Builder form of `register_entity`.
    pub fn with_entity<E: Entity>(mut self) -> Result<Self, EntityError> {
        self.register_entity::<E>()?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityDescriptor>> {
        self.entities.get(name).cloned()
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<EntityDescriptor>, EntityError> {
        self.get(name)
            .ok_or_else(|| EntityError::UnknownEntity(name.to_string()))
    }

    /// Returns sorted kind names.
    pub fn kinds(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
