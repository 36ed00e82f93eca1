//! Cloud object types and their per-type registration descriptors.
//!
//! A host instantiates objects through a [`TypeCatalog`]: each entry pairs a
//! [`TypeDescriptor`] (file dependencies, transient fields, migration hooks,
//! serialization strategy) with the factory that builds instances once the
//! type's code artifact is resident.

pub mod serialization;

use crate::classloading::CodeArtifact;
use crate::registry::InvocationContext;
use serialization::{FieldStreamSerializer, SerializationStrategy};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Why a field write was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    Unknown,
    Rejected(String),
}

/// A live object hosted by a registry.
///
/// Methods take `&self`: the registry runs concurrent invocations on the same
/// instance and leaves state synchronisation to the implementation.
pub trait CloudObject: Send + Sync + 'static {
    /// Runs `method`. An `Err` is an application failure and is reported as a
    /// `Failed` invocation result, never as a transport error.
    fn invoke(
        &self,
        method: &str,
        params: &[Vec<u8>],
        param_names: &[String],
        ctx: &InvocationContext,
    ) -> Result<Vec<u8>, String>;

    /// Serialized value of a field, `None` when the field does not exist
    fn field(&self, name: &str) -> Option<Vec<u8>>;

    fn set_field(&self, name: &str, value: &[u8]) -> Result<(), FieldError>;

    /// Null out a field. Returns false when the field does not exist.
    fn reset_field(&self, name: &str) -> bool;

    fn field_names(&self) -> Vec<String>;

    /// Runs a migration-preparation hook declared on the type
    fn run_hook(&self, hook: &str) -> Result<(), String> {
        Err(format!("no migration hook named {hook}"))
    }
}

/// Builds instances of one cloud type from its resident code artifact
pub trait CloudTypeFactory: Send + Sync {
    fn instantiate(
        &self,
        code: &CodeArtifact,
        params: &[Vec<u8>],
        param_names: &[String],
    ) -> Result<Arc<dyn CloudObject>, String>;
}

impl<F> CloudTypeFactory for F
where
    F: Fn(&CodeArtifact, &[Vec<u8>], &[String]) -> Result<Arc<dyn CloudObject>, String> + Send + Sync,
{
    fn instantiate(
        &self,
        code: &CodeArtifact,
        params: &[Vec<u8>],
        param_names: &[String],
    ) -> Result<Arc<dyn CloudObject>, String> {
        self(code, params, param_names)
    }
}

/// File a type needs on its host before instantiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredFile {
    pub path: String,
    pub read_only: bool,
}

impl DeclaredFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), read_only: false }
    }

    pub fn read_only(path: impl Into<String>) -> Self {
        Self { path: path.into(), read_only: true }
    }
}

/// Enumerates a type's files at object-creation time
pub trait FileDependencyProvider: Send + Sync {
    fn files(&self, type_name: &str) -> Vec<DeclaredFile>;
}

impl<F> FileDependencyProvider for F
where
    F: Fn(&str) -> Vec<DeclaredFile> + Send + Sync,
{
    fn files(&self, type_name: &str) -> Vec<DeclaredFile> {
        self(type_name)
    }
}

#[derive(Clone, Default)]
pub enum FileDependencies {
    #[default]
    None,
    Static(Vec<DeclaredFile>),
    Dynamic(Arc<dyn FileDependencyProvider>),
}

impl FileDependencies {
    pub fn resolve(&self, type_name: &str) -> Vec<DeclaredFile> {
        match self {
            FileDependencies::None => Vec::new(),
            FileDependencies::Static(files) => files.clone(),
            FileDependencies::Dynamic(provider) => provider.files(type_name),
        }
    }
}

impl fmt::Debug for FileDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileDependencies::None => f.write_str("None"),
            FileDependencies::Static(files) => f.debug_tuple("Static").field(files).finish(),
            FileDependencies::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

type Initializer = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Field that does not survive a migration
#[derive(Clone)]
pub struct TransientField {
    pub name: String,
    /// Produces the value written in place of the old one; `None` nulls the field
    pub initializer: Option<Initializer>,
}

impl fmt::Debug for TransientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientField")
            .field("name", &self.name)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}

pub const DEFAULT_HOOK_PRIORITY: i32 = i32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationHook {
    pub name: String,
    pub priority: i32,
}

/// Per-type configuration, built once and consulted as a lookup table
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub type_name: String,
    /// Archive the type's code ships in, if it is not a standalone unit
    pub archive_name: Option<String>,
    pub file_dependencies: FileDependencies,
    pub transient_fields: Vec<TransientField>,
    /// Sorted by ascending priority
    pub migration_hooks: Vec<MigrationHook>,
    pub serialization: Arc<dyn SerializationStrategy>,
}

impl TypeDescriptor {
    pub fn builder(type_name: impl Into<String>) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            descriptor: TypeDescriptor {
                type_name: type_name.into(),
                archive_name: None,
                file_dependencies: FileDependencies::None,
                transient_fields: Vec::new(),
                migration_hooks: Vec::new(),
                serialization: Arc::new(FieldStreamSerializer),
            },
        }
    }

    pub fn is_transient(&self, field: &str) -> bool {
        self.transient_fields.iter().any(|t| t.name == field)
    }

    /// Name the code artifact is requested and cached under
    pub fn artifact_name(&self) -> &str {
        self.archive_name.as_deref().unwrap_or(&self.type_name)
    }
}

pub struct TypeDescriptorBuilder {
    descriptor: TypeDescriptor,
}

impl TypeDescriptorBuilder {
    pub fn archive(mut self, archive_name: impl Into<String>) -> Self {
        self.descriptor.archive_name = Some(archive_name.into());
        self
    }

    pub fn file(mut self, file: DeclaredFile) -> Self {
        match &mut self.descriptor.file_dependencies {
            FileDependencies::Static(files) => files.push(file),
            deps => *deps = FileDependencies::Static(vec![file]),
        }
        self
    }

    pub fn file_provider(mut self, provider: impl FileDependencyProvider + 'static) -> Self {
        self.descriptor.file_dependencies = FileDependencies::Dynamic(Arc::new(provider));
        self
    }

    pub fn transient(mut self, field: impl Into<String>) -> Self {
        self.descriptor.transient_fields.push(TransientField { name: field.into(), initializer: None });
        self
    }

    pub fn transient_with<F>(mut self, field: impl Into<String>, initializer: F) -> Self
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.descriptor.transient_fields.push(TransientField {
            name: field.into(),
            initializer: Some(Arc::new(initializer)),
        });
        self
    }

    pub fn hook(mut self, name: impl Into<String>, priority: i32) -> Self {
        self.descriptor.migration_hooks.push(MigrationHook { name: name.into(), priority });
        self
    }

    pub fn hook_default(self, name: impl Into<String>) -> Self {
        self.hook(name, DEFAULT_HOOK_PRIORITY)
    }

    pub fn serialization(mut self, strategy: Arc<dyn SerializationStrategy>) -> Self {
        self.descriptor.serialization = strategy;
        self
    }

    pub fn build(mut self) -> TypeDescriptor {
        // stable sort: equal priorities keep declaration order, nothing more is promised
        self.descriptor.migration_hooks.sort_by_key(|h| h.priority);
        self.descriptor
    }
}

pub struct TypeRegistration {
    pub descriptor: TypeDescriptor,
    pub factory: Arc<dyn CloudTypeFactory>,
}

/// Types a host knows how to instantiate
#[derive(Default)]
pub struct TypeCatalog {
    types: HashMap<String, Arc<TypeRegistration>>,
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TypeDescriptor, factory: impl CloudTypeFactory + 'static) -> &mut Self {
        let name = descriptor.type_name.clone();
        self.types.insert(
            name,
            Arc::new(TypeRegistration { descriptor, factory: Arc::new(factory) }),
        );
        self
    }

    /// Same as [`register`](Self::register) with closure signature inference
    pub fn register_fn<F>(&mut self, descriptor: TypeDescriptor, factory: F) -> &mut Self
    where
        F: Fn(&CodeArtifact, &[Vec<u8>], &[String]) -> Result<Arc<dyn CloudObject>, String> + Send + Sync + 'static,
    {
        self.register(descriptor, factory)
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<TypeRegistration>> {
        self.types.get(type_name).cloned()
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_ordered_by_ascending_priority() {
        let descriptor = TypeDescriptor::builder("Counter")
            .hook_default("last")
            .hook("first", -5)
            .hook("middle", 10)
            .build();

        let order: Vec<_> = descriptor.migration_hooks.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(order, vec!["first", "middle", "last"]);
    }

    #[test]
    fn static_and_dynamic_file_dependencies() {
        let fixed = TypeDescriptor::builder("Counter")
            .file(DeclaredFile::read_only("conf/limits.json"))
            .file(DeclaredFile::new("data/seed.bin"))
            .build();
        assert_eq!(fixed.file_dependencies.resolve("Counter").len(), 2);

        let dynamic = TypeDescriptor::builder("Report")
            .file_provider(|name: &str| vec![DeclaredFile::new(format!("templates/{name}.txt"))])
            .build();
        assert_eq!(
            dynamic.file_dependencies.resolve("Report"),
            vec![DeclaredFile::new("templates/Report.txt")]
        );
    }

    #[test]
    fn artifact_name_prefers_archive() {
        let unit = TypeDescriptor::builder("Counter").build();
        assert_eq!(unit.artifact_name(), "Counter");

        let packaged = TypeDescriptor::builder("Counter").archive("counters.car").transient("cache").build();
        assert_eq!(packaged.artifact_name(), "counters.car");
        assert!(packaged.is_transient("cache"));
        assert!(!packaged.is_transient("count"));
    }
}
