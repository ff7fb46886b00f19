//! Compile-dependency inversion index.
//!
//! Two mutually inverse mappings over the same relation: resource -> source
//! files whose change must recompile it, and source file -> resources that
//! depend on it. The second is what turns an arbitrary file-change event
//! into recompilation requests. Both sides are only ever touched from the
//! driver.

use std::collections::HashMap;

use anvil_proto::ResourceId;
use camino::{Utf8Path, Utf8PathBuf};

#[derive(Debug, Default)]
pub struct DependencyIndex {
    by_resource: HashMap<ResourceId, Vec<Utf8PathBuf>>,
    by_file: HashMap<Utf8PathBuf, Vec<ResourceId>>,
}

impl DependencyIndex {
    /// Replace the recorded dependencies of `resource_id` with `new_deps`
    /// (absolute source paths). Stale inverse entries are removed first so
    /// the two maps stay mutual inverses.
    pub fn update_dependencies(&mut self, resource_id: &ResourceId, new_deps: Vec<Utf8PathBuf>) {
        if let Some(previous) = self.by_resource.get(resource_id) {
            for file in previous {
                if let Some(dependents) = self.by_file.get_mut(file) {
                    dependents.retain(|dependent| dependent != resource_id);
                    if dependents.is_empty() {
                        self.by_file.remove(file);
                    }
                }
            }
        }

        let dependencies = self.by_resource.entry(resource_id.clone()).or_default();
        dependencies.clear();

        for file in new_deps {
            let dependents = self.by_file.entry(file.clone()).or_default();
            if !dependents.contains(resource_id) {
                dependents.push(resource_id.clone());
            }
            if !dependencies.contains(&file) {
                dependencies.push(file);
            }
        }
    }

    /// Every resource that must recompile when `source_path` changes.
    /// Returns a copy: callers iterate it while creating requests, and
    /// request creation mutates this index.
    pub fn dependents_of(&self, source_path: &Utf8Path) -> Vec<ResourceId> {
        self.by_file.get(source_path).cloned().unwrap_or_default()
    }

    pub fn dependencies_of(&self, resource_id: &ResourceId) -> &[Utf8PathBuf] {
        self.by_resource
            .get(resource_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        for (resource, files) in &self.by_resource {
            for file in files {
                assert!(
                    self.by_file
                        .get(file)
                        .is_some_and(|dependents| dependents.contains(resource)),
                    "missing inverse entry for {resource} -> {file}"
                );
            }
        }
        for (file, dependents) in &self.by_file {
            for resource in dependents {
                assert!(
                    self.by_resource
                        .get(resource)
                        .is_some_and(|files| files.contains(file)),
                    "missing forward entry for {file} -> {resource}"
                );
            }
        }
    }
}
