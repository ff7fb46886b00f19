//! Boot-time collaborators: resource type registry, compiler registry,
//! engine module registry and the resource descriptor loader.
//!
//! The core never owns compiler knowledge; it dispatches over these traits
//! and the embedding application wires concrete registries at initialize.

use std::collections::{HashMap, HashSet};

use anvil_proto::{ResourceId, ResourceTypeId};
use camino::Utf8Path;
use serde::Deserialize;
use tracing::debug;

// =============================================================================
// TYPE REGISTRY
// =============================================================================

/// The set of resource types the server knows about, and which of them are
/// entity descriptors. Entity descriptors carry no resource descriptor
/// file, so no compile-dependency tracking happens for them.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    resource_types: HashSet<ResourceTypeId>,
    entity_descriptor_types: HashSet<ResourceTypeId>,
}

impl TypeRegistry {
    pub fn register_resource_type(&mut self, type_id: ResourceTypeId) {
        self.resource_types.insert(type_id);
    }

    /// Entity descriptor types are resource types too.
    pub fn register_entity_descriptor_type(&mut self, type_id: ResourceTypeId) {
        self.resource_types.insert(type_id);
        self.entity_descriptor_types.insert(type_id);
    }

    pub fn is_registered(&self, type_id: ResourceTypeId) -> bool {
        self.resource_types.contains(&type_id)
    }

    pub fn is_entity_descriptor(&self, type_id: ResourceTypeId) -> bool {
        self.entity_descriptor_types.contains(&type_id)
    }
}

// =============================================================================
// COMPILER REGISTRY
// =============================================================================

/// A registered resource compiler. The only capability the core needs is
/// the install-dependency query used by the packaging traversal.
pub trait ResourceCompiler: Send + Sync {
    /// Resources that must be present at runtime if `resource_id` is
    /// loaded.
    fn install_dependencies(&self, resource_id: &ResourceId) -> Vec<ResourceId>;
}

pub trait CompilerRegistry: Send + Sync {
    fn compiler_for(&self, type_id: ResourceTypeId) -> Option<&dyn ResourceCompiler>;
}

/// Compiler registry backed by a plain map, built once at boot.
#[derive(Default)]
pub struct StaticCompilerRegistry {
    compilers: HashMap<ResourceTypeId, Box<dyn ResourceCompiler>>,
}

impl StaticCompilerRegistry {
    pub fn register(
        &mut self,
        type_id: ResourceTypeId,
        compiler: Box<dyn ResourceCompiler>,
    ) -> &mut Self {
        self.compilers.insert(type_id, compiler);
        self
    }
}

impl CompilerRegistry for StaticCompilerRegistry {
    fn compiler_for(&self, type_id: ResourceTypeId) -> Option<&dyn ResourceCompiler> {
        self.compilers.get(&type_id).map(|compiler| &**compiler)
    }
}

/// A compiler with a fixed install-dependency table. Types whose resources
/// reference nothing at runtime register one with an empty table.
#[derive(Default)]
pub struct TableCompiler {
    install_dependencies: HashMap<ResourceId, Vec<ResourceId>>,
}

impl TableCompiler {
    pub fn with_dependencies(
        entries: impl IntoIterator<Item = (ResourceId, Vec<ResourceId>)>,
    ) -> Self {
        Self {
            install_dependencies: entries.into_iter().collect(),
        }
    }
}

impl ResourceCompiler for TableCompiler {
    fn install_dependencies(&self, resource_id: &ResourceId) -> Vec<ResourceId> {
        self.install_dependencies
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }
}

// =============================================================================
// MODULE REGISTRY
// =============================================================================

/// Runtime resources of the well-known engine modules (Base, Engine, Game).
/// Packaging adds these unconditionally before expanding any map.
pub trait ModuleRegistry: Send + Sync {
    fn module_resources(&self) -> Vec<ResourceId>;
}

#[derive(Debug, Default)]
pub struct StaticModuleRegistry {
    resources: Vec<ResourceId>,
}

impl StaticModuleRegistry {
    pub fn new(resources: Vec<ResourceId>) -> Self {
        Self { resources }
    }
}

impl ModuleRegistry for StaticModuleRegistry {
    fn module_resources(&self) -> Vec<ResourceId> {
        self.resources.clone()
    }
}

// =============================================================================
// DESCRIPTOR LOADER
// =============================================================================

/// Reads a resource descriptor file and yields its declared compile
/// dependencies as data paths. Returning `None` means the descriptor could
/// not be read; the request proceeds without dependency tracking.
pub trait DescriptorLoader: Send + Sync {
    fn compile_dependencies(&self, source_file: &Utf8Path) -> Option<Vec<String>>;
}

#[derive(Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    compile_dependencies: Vec<String>,
}

/// Loader for the JSON descriptor format.
#[derive(Debug, Default)]
pub struct JsonDescriptorLoader;

impl DescriptorLoader for JsonDescriptorLoader {
    fn compile_dependencies(&self, source_file: &Utf8Path) -> Option<Vec<String>> {
        let raw = std::fs::read_to_string(source_file).ok()?;
        match serde_json::from_str::<DescriptorFile>(&raw) {
            Ok(descriptor) => Some(descriptor.compile_dependencies),
            Err(e) => {
                debug!(path = %source_file, error = %e, "unreadable resource descriptor");
                None
            }
        }
    }
}
