//! Packaging: expanding a set of maps into the full runtime install set.
//!
//! `None -> Preparing -> Packaging -> Complete`, restartable from `None`
//! and `Complete`. Preparation runs as a background task walking the
//! install-dependency graph through the compiler registry; the driver then
//! turns the resolved list into Package-origin requests and watches them
//! drain.

use std::sync::Arc;

use anvil_proto::{ResourceId, ResourceTypeId};
use camino::Utf8Path;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::request::SharedRequest;
use crate::server::ServerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagingStage {
    None,
    Preparing,
    Packaging,
    Complete,
}

pub struct PackagingEngine {
    stage: PackagingStage,
    available_maps: Vec<ResourceId>,
    maps_to_package: Vec<ResourceId>,
    package_requests: Vec<SharedRequest>,
    prepare: Option<JoinHandle<Vec<ResourceId>>>,
}

impl Default for PackagingEngine {
    fn default() -> Self {
        Self {
            stage: PackagingStage::None,
            available_maps: Vec::new(),
            maps_to_package: Vec::new(),
            package_requests: Vec::new(),
            prepare: None,
        }
    }
}

impl PackagingEngine {
    pub fn stage(&self) -> PackagingStage {
        self.stage
    }

    pub fn is_packaging(&self) -> bool {
        matches!(self.stage, PackagingStage::Preparing | PackagingStage::Packaging)
    }

    /// Rescan the source tree for map resources.
    pub fn refresh_available_maps(&mut self, source_root: &Utf8Path) {
        self.available_maps.clear();
        scan_for_maps(source_root, source_root, &mut self.available_maps);
        debug!(count = self.available_maps.len(), "refreshed available map list");
    }

    pub fn available_maps(&self) -> &[ResourceId] {
        &self.available_maps
    }

    pub fn maps_to_package(&self) -> &[ResourceId] {
        &self.maps_to_package
    }

    /// Add a map to the packaging root set. Only map resources are
    /// accepted; duplicates are ignored.
    pub fn add_map_to_packaging_list(&mut self, map_id: ResourceId) -> bool {
        if map_id.type_id() != Some(ResourceTypeId::MAP) {
            return false;
        }
        if !self.maps_to_package.contains(&map_id) {
            self.maps_to_package.push(map_id);
        }
        true
    }

    pub fn remove_map_from_packaging_list(&mut self, map_id: &ResourceId) {
        self.maps_to_package.retain(|id| id != map_id);
    }

    pub fn can_start_packaging(&self) -> bool {
        matches!(self.stage, PackagingStage::None | PackagingStage::Complete)
            && !self.maps_to_package.is_empty()
    }

    /// Kick off preparation. No-op unless `can_start_packaging`.
    pub fn start_packaging(&mut self, ctx: Arc<ServerContext>) {
        if !self.can_start_packaging() {
            return;
        }

        info!(maps = self.maps_to_package.len(), "packaging started");
        let maps = self.maps_to_package.clone();
        self.prepare = Some(tokio::spawn(
            async move { resolve_package_set(&ctx, &maps) },
        ));
        self.stage = PackagingStage::Preparing;
    }

    /// If preparation finished this tick, hand back the resolved resource
    /// list. The caller creates the Package-origin requests and passes them
    /// to `begin_packaging`.
    pub async fn take_prepared(&mut self) -> Option<Vec<ResourceId>> {
        if self.stage != PackagingStage::Preparing {
            return None;
        }
        if !self.prepare.as_ref().is_some_and(JoinHandle::is_finished) {
            return None;
        }
        let handle = self.prepare.take()?;
        Some(handle.await.unwrap_or_default())
    }

    pub fn begin_packaging(&mut self, requests: Vec<SharedRequest>) {
        debug!(resources = requests.len(), "packaging requests scheduled");
        self.package_requests = requests;
        self.stage = PackagingStage::Packaging;
    }

    /// Move `Packaging -> Complete` once every tracked request is terminal.
    pub fn update_completion(&mut self) {
        if self.stage != PackagingStage::Packaging {
            return;
        }
        if self
            .package_requests
            .iter()
            .all(|request| request.lock().is_complete())
        {
            self.package_requests.clear();
            self.stage = PackagingStage::Complete;
            info!("packaging complete");
        }
    }

    /// Progress hint in [0, 1] for UI consumption only.
    pub fn progress(&self) -> f32 {
        match self.stage {
            PackagingStage::None | PackagingStage::Complete => 1.0,
            PackagingStage::Preparing => 0.1,
            PackagingStage::Packaging => {
                let total = self.package_requests.len();
                let fraction = if total == 0 {
                    1.0
                } else {
                    let complete = self
                        .package_requests
                        .iter()
                        .filter(|request| request.lock().is_complete())
                        .count();
                    complete as f32 / total as f32
                };
                0.05 + 0.95 * fraction
            }
        }
    }

    /// Wait out a still-running preparation task. The task observes the
    /// exit flag and returns promptly.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.prepare.take() {
            let _ = handle.await;
        }
        self.package_requests.clear();
    }
}

/// Module resources first, unconditionally; then every seed map expanded
/// recursively through `install_dependencies`. First-seen order, deduped.
fn resolve_package_set(ctx: &ServerContext, maps: &[ResourceId]) -> Vec<ResourceId> {
    let mut resolved = Vec::new();
    for resource in ctx.module_registry.module_resources() {
        push_unique(&mut resolved, resource);
    }
    for map in maps {
        expand_install_dependencies(ctx, map.clone(), &mut resolved);
    }
    resolved
}

fn expand_install_dependencies(
    ctx: &ServerContext,
    resource_id: ResourceId,
    resolved: &mut Vec<ResourceId>,
) {
    if ctx.is_exiting() {
        return;
    }
    let Some(type_id) = resource_id.type_id() else {
        return;
    };
    // No registered compiler terminates the expansion.
    let Some(compiler) = ctx.compiler_registry.compiler_for(type_id) else {
        return;
    };
    // Already visited: nothing new below it either.
    if !push_unique(resolved, resource_id.clone()) {
        return;
    }
    for dependency in compiler.install_dependencies(&resource_id) {
        expand_install_dependencies(ctx, dependency, resolved);
    }
}

fn push_unique(list: &mut Vec<ResourceId>, id: ResourceId) -> bool {
    if list.contains(&id) {
        return false;
    }
    list.push(id);
    true
}

fn scan_for_maps(dir: &Utf8Path, source_root: &Utf8Path, found: &mut Vec<ResourceId>) {
    let Ok(entries) = std::fs::read_dir(dir.as_std_path()) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(path) = camino::Utf8PathBuf::from_path_buf(entry.path()) else {
            continue;
        };
        if path.is_dir() {
            scan_for_maps(&path, source_root, found);
        } else if path.extension() == Some(ResourceTypeId::MAP.as_str()) {
            if let Ok(relative) = path.strip_prefix(source_root) {
                if let Some(id) = ResourceId::from_data_path(relative) {
                    found.push(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{StaticCompilerRegistry, StaticModuleRegistry, TableCompiler};
    use crate::server::Collaborators;
    use crate::settings::ServerSettings;
    use camino::Utf8PathBuf;
    use std::time::Duration;

    fn test_settings() -> ServerSettings {
        ServerSettings {
            source_data_dir: Utf8PathBuf::from("/data/source"),
            compiled_resource_dir: Utf8PathBuf::from("/data/compiled"),
            packaged_build_dir: Utf8PathBuf::from("/data/packaged"),
            compiler_executable: Utf8PathBuf::from("/bin/resource-compiler"),
            port: 0,
            worker_count: 2,
        }
    }

    fn tag(s: &str) -> ResourceTypeId {
        ResourceTypeId::from_tag(s).unwrap()
    }

    async fn prepared_list(engine: &mut PackagingEngine) -> Vec<ResourceId> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(list) = engine.take_prepared().await {
                return list;
            }
            assert!(std::time::Instant::now() < deadline, "preparation never finished");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn only_maps_enter_the_packaging_list() {
        let mut engine = PackagingEngine::default();
        assert!(!engine.add_map_to_packaging_list(ResourceId::new("mesh:a.msh")));
        assert!(engine.add_map_to_packaging_list(ResourceId::new("map:world.map")));
        assert!(engine.add_map_to_packaging_list(ResourceId::new("map:world.map")));
        assert_eq!(engine.maps_to_package().len(), 1);

        engine.remove_map_from_packaging_list(&ResourceId::new("map:world.map"));
        assert!(engine.maps_to_package().is_empty());
        assert!(!engine.can_start_packaging());
    }

    #[test]
    fn progress_hints() {
        let engine = PackagingEngine::default();
        assert_eq!(engine.progress(), 1.0);

        let mut engine = PackagingEngine::default();
        engine.stage = PackagingStage::Preparing;
        assert_eq!(engine.progress(), 0.1);

        engine.stage = PackagingStage::Complete;
        assert_eq!(engine.progress(), 1.0);
    }

    #[tokio::test]
    async fn closure_expansion_dedupes_in_first_seen_order() {
        let world = ResourceId::new("map:world.map");
        let mesh = ResourceId::new("mesh:a.msh");
        let tex = ResourceId::new("tex:b.tex");
        let engine_res = ResourceId::new("shdr:engine/default.shdr");

        let mut compilers = StaticCompilerRegistry::default();
        compilers.register(
            ResourceTypeId::MAP,
            Box::new(TableCompiler::with_dependencies([(
                world.clone(),
                vec![mesh.clone(), tex.clone(), mesh.clone()],
            )])),
        );
        compilers.register(tag("mesh"), Box::new(TableCompiler::default()));
        compilers.register(tag("tex"), Box::new(TableCompiler::default()));

        let ctx = Arc::new(ServerContext::new(
            &test_settings(),
            Collaborators {
                compiler_registry: Arc::new(compilers),
                module_registry: Arc::new(StaticModuleRegistry::new(vec![engine_res.clone()])),
                ..Default::default()
            },
        ));

        let mut engine = PackagingEngine::default();
        engine.add_map_to_packaging_list(world.clone());
        assert!(engine.can_start_packaging());
        engine.start_packaging(ctx);
        assert_eq!(engine.stage(), PackagingStage::Preparing);
        assert!(!engine.can_start_packaging());

        let resolved = prepared_list(&mut engine).await;
        // Module resources come first and are not expanded (no compiler);
        // the map's install closure follows in discovery order.
        assert_eq!(resolved, vec![engine_res, world, mesh, tex]);
    }

    #[tokio::test]
    async fn cyclic_install_dependencies_terminate() {
        let world = ResourceId::new("map:world.map");
        let mesh = ResourceId::new("mesh:a.msh");

        let mut compilers = StaticCompilerRegistry::default();
        compilers.register(
            ResourceTypeId::MAP,
            Box::new(TableCompiler::with_dependencies([(
                world.clone(),
                vec![mesh.clone()],
            )])),
        );
        compilers.register(
            tag("mesh"),
            Box::new(TableCompiler::with_dependencies([(
                mesh.clone(),
                vec![world.clone()],
            )])),
        );

        let ctx = Arc::new(ServerContext::new(
            &test_settings(),
            Collaborators {
                compiler_registry: Arc::new(compilers),
                ..Default::default()
            },
        ));

        let mut engine = PackagingEngine::default();
        engine.add_map_to_packaging_list(world.clone());
        engine.start_packaging(ctx);

        let resolved = prepared_list(&mut engine).await;
        assert_eq!(resolved, vec![world, mesh]);
    }

    #[test]
    fn map_scan_finds_nested_maps() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir_all(root.join("levels").as_std_path()).unwrap();
        std::fs::write(root.join("levels/world.map").as_std_path(), b"{}").unwrap();
        std::fs::write(root.join("readme.txt").as_std_path(), b"-").unwrap();

        let mut engine = PackagingEngine::default();
        engine.refresh_available_maps(&root);
        assert_eq!(
            engine.available_maps(),
            &[ResourceId::new("map:levels/world.map")]
        );
    }
}
