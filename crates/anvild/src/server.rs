//! The resource server aggregate: request creation and lifecycle, the tick
//! loop, completed-request fanout and shutdown.
//!
//! One driver task owns every piece of core state (request list, active
//! tasks, dependency index, packaging state, connected-client snapshot).
//! Worker tasks own their request only while it compiles; the transport and
//! watcher feed the driver through channels it drains each tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anvil_proto::{
    ClientId, Frame, MessageId, ResourceId, ResourceResponse, ResourceResult, ResourceTypeId,
};
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::deps::DependencyIndex;
use crate::error::{Result, ServerError};
use crate::net::NetworkServer;
use crate::packaging::PackagingEngine;
use crate::registry::{
    CompilerRegistry, DescriptorLoader, JsonDescriptorLoader, ModuleRegistry,
    StaticCompilerRegistry, StaticModuleRegistry, TypeRegistry,
};
use crate::request::{CompilationRequest, RequestOrigin, RequestStatus, SharedRequest};
use crate::settings::ServerSettings;
use crate::task::{CompilationTask, CompilerPool};
use crate::watcher::FileWatcher;

/// A response frame never carries more than this many result tuples.
const RESULTS_PER_RESPONSE: usize = 64;

// =============================================================================
// CONTEXT & COLLABORATORS
// =============================================================================

/// The injectable boot-time collaborators. Defaults are empty registries
/// and the JSON descriptor loader; the embedding application supplies real
/// ones.
pub struct Collaborators {
    pub type_registry: TypeRegistry,
    pub compiler_registry: Arc<dyn CompilerRegistry>,
    pub module_registry: Arc<dyn ModuleRegistry>,
    pub descriptor_loader: Arc<dyn DescriptorLoader>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            type_registry: TypeRegistry::default(),
            compiler_registry: Arc::new(StaticCompilerRegistry::default()),
            module_registry: Arc::new(StaticModuleRegistry::default()),
            descriptor_loader: Arc::new(JsonDescriptorLoader),
        }
    }
}

/// Immutable state shared with worker and packaging tasks.
pub struct ServerContext {
    pub source_data_dir: Utf8PathBuf,
    pub compiled_resource_dir: Utf8PathBuf,
    pub packaged_build_dir: Utf8PathBuf,
    pub compiler_executable: Utf8PathBuf,
    pub type_registry: TypeRegistry,
    pub compiler_registry: Arc<dyn CompilerRegistry>,
    pub module_registry: Arc<dyn ModuleRegistry>,
    pub descriptor_loader: Arc<dyn DescriptorLoader>,
    is_exiting: AtomicBool,
}

impl ServerContext {
    pub fn new(settings: &ServerSettings, collaborators: Collaborators) -> Self {
        Self {
            source_data_dir: settings.source_data_dir.clone(),
            compiled_resource_dir: settings.compiled_resource_dir.clone(),
            packaged_build_dir: settings.packaged_build_dir.clone(),
            compiler_executable: settings.compiler_executable.clone(),
            type_registry: collaborators.type_registry,
            compiler_registry: collaborators.compiler_registry,
            module_registry: collaborators.module_registry,
            descriptor_loader: collaborators.descriptor_loader,
            is_exiting: AtomicBool::new(false),
        }
    }

    /// Cooperative shutdown flag, observed by worker tasks before they
    /// spawn a compiler and by the packaging traversal.
    pub fn is_exiting(&self) -> bool {
        self.is_exiting.load(Ordering::Acquire)
    }

    fn begin_exit(&self) {
        self.is_exiting.store(true, Ordering::Release);
    }
}

// =============================================================================
// SERVER
// =============================================================================

pub struct ResourceServer {
    ctx: Arc<ServerContext>,
    network: NetworkServer,
    watcher: Option<FileWatcher>,
    pool: CompilerPool,
    /// Master request list. Deliberately a log, not a set: duplicate
    /// requests for one resource each run, and the compiler's up-to-date
    /// short-circuit keeps the redundant ones cheap.
    requests: Vec<SharedRequest>,
    active_tasks: Vec<CompilationTask>,
    scheduled_task_count: usize,
    dependency_index: DependencyIndex,
    packaging: PackagingEngine,
    cleanup_requested: bool,
}

impl ResourceServer {
    pub async fn initialize(
        settings: ServerSettings,
        collaborators: Collaborators,
    ) -> Result<Self> {
        for dir in [
            &settings.source_data_dir,
            &settings.compiled_resource_dir,
            &settings.packaged_build_dir,
        ] {
            std::fs::create_dir_all(dir.as_std_path()).map_err(|e| ServerError::CreateDir {
                path: dir.clone(),
                message: e.to_string(),
            })?;
        }

        let network = NetworkServer::bind(settings.port).await?;
        let watcher = FileWatcher::start(&settings.source_data_dir)?;
        let pool = CompilerPool::new(settings.worker_count);
        let ctx = Arc::new(ServerContext::new(&settings, collaborators));

        let mut packaging = PackagingEngine::default();
        packaging.refresh_available_maps(&ctx.source_data_dir);

        info!(
            addr = %network.local_addr(),
            source = %ctx.source_data_dir,
            compiler = %ctx.compiler_executable,
            "resource server ready"
        );

        Ok(Self {
            ctx,
            network,
            watcher: Some(watcher),
            pool,
            requests: Vec::new(),
            active_tasks: Vec::new(),
            scheduled_task_count: 0,
            dependency_index: DependencyIndex::default(),
            packaging,
            cleanup_requested: false,
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.network.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.network.client_count()
    }

    pub fn requests(&self) -> &[SharedRequest] {
        &self.requests
    }

    pub fn dependency_index(&self) -> &DependencyIndex {
        &self.dependency_index
    }

    pub fn packaging(&self) -> &PackagingEngine {
        &self.packaging
    }

    pub fn packaging_mut(&mut self) -> &mut PackagingEngine {
        &mut self.packaging
    }

    pub fn watcher(&self) -> Option<&FileWatcher> {
        self.watcher.as_ref()
    }

    /// True while any request is outstanding or packaging is running.
    pub fn is_busy(&self) -> bool {
        self.packaging.is_packaging() || self.scheduled_task_count != 0
    }

    /// Purge every terminal request on the next tick.
    pub fn request_cleanup(&mut self) {
        self.cleanup_requested = true;
    }

    pub fn start_packaging(&mut self) {
        let ctx = self.ctx.clone();
        self.packaging.start_packaging(ctx);
    }

    // =========================================================================
    // REQUEST CREATION
    // =========================================================================

    pub fn create_request(
        &mut self,
        resource_id: ResourceId,
        client_id: ClientId,
        origin: RequestOrigin,
        extra_info: impl Into<String>,
    ) -> SharedRequest {
        self.create_request_inner(resource_id, client_id, origin, extra_info.into(), false)
    }

    /// Create a request that passes `-force` to the compiler. The hook for
    /// a force-rebuild command; never used for Package-origin requests.
    pub fn create_forced_request(
        &mut self,
        resource_id: ResourceId,
        client_id: ClientId,
        origin: RequestOrigin,
        extra_info: impl Into<String>,
    ) -> SharedRequest {
        debug_assert!(origin != RequestOrigin::Package);
        self.create_request_inner(resource_id, client_id, origin, extra_info.into(), true)
    }

    fn create_request_inner(
        &mut self,
        resource_id: ResourceId,
        client_id: ClientId,
        origin: RequestOrigin,
        extra_info: String,
        force_recompilation: bool,
    ) -> SharedRequest {
        match origin {
            RequestOrigin::External => assert!(client_id != 0),
            RequestOrigin::FileWatcher | RequestOrigin::Package => assert!(client_id == 0),
        }

        let mut request = CompilationRequest {
            resource_id,
            client_id,
            origin,
            compiler_args: String::new(),
            source_file: Utf8PathBuf::new(),
            destination_file: Utf8PathBuf::new(),
            status: RequestStatus::Pending,
            force_recompilation,
            time_started: None,
            time_finished: None,
            log: String::new(),
            extra_info,
        };

        if let Some(data_path) = request.resource_id.data_path() {
            request.compiler_args = data_path.to_string();
            request.source_file = self.ctx.source_data_dir.join(data_path);
            // Packaging output goes to the shipping tree.
            let output_root = match origin {
                RequestOrigin::Package => &self.ctx.packaged_build_dir,
                _ => &self.ctx.compiled_resource_dir,
            };
            request.destination_file = output_root.join(data_path);
            debug!(
                resource = %request.resource_id,
                ?origin,
                client_id,
                "request created"
            );
        } else {
            // Synthesized already-failed: enqueued like every other request
            // for uniform downstream handling, but no compiler ever runs.
            request.log = format!("Error: Invalid resource ID ( {} )", request.resource_id);
            request.status = RequestStatus::Failed;
            warn!(resource = %request.resource_id, client_id, "invalid resource id requested");
        }

        let request = Arc::new(Mutex::new(request));
        self.requests.push(request.clone());
        let task = self.pool.spawn(self.ctx.clone(), request.clone());
        self.active_tasks.push(task);
        self.scheduled_task_count += 1;

        self.refresh_compile_dependencies(&request);

        request
    }

    /// Load the resource descriptor and record its declared compile
    /// dependencies. Entity descriptors have no descriptor file; load
    /// failure is non-fatal and skips tracking for this request.
    fn refresh_compile_dependencies(&mut self, request: &SharedRequest) {
        let (resource_id, source_file) = {
            let request = request.lock();
            let Some(type_id) = request.resource_id.type_id() else {
                return;
            };
            if self.ctx.type_registry.is_entity_descriptor(type_id) {
                return;
            }
            (request.resource_id.clone(), request.source_file.clone())
        };

        let Some(declared) = self.ctx.descriptor_loader.compile_dependencies(&source_file) else {
            return;
        };
        let resolved = declared
            .iter()
            .map(|data_path| self.ctx.source_data_dir.join(data_path))
            .collect();
        self.dependency_index
            .update_dependencies(&resource_id, resolved);
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// One server-loop iteration: pump the transport, advance packaging,
    /// reap the pool, honor cleanup, dispatch file events.
    pub async fn update(&mut self) {
        self.pump_network();

        if let Some(resolved) = self.packaging.take_prepared().await {
            let requests: Vec<SharedRequest> = resolved
                .into_iter()
                .map(|id| self.create_request(id, 0, RequestOrigin::Package, ""))
                .collect();
            self.packaging.begin_packaging(requests);
        }
        self.packaging.update_completion();

        self.process_completed_requests();

        if self.cleanup_requested {
            self.requests.retain(|request| !request.lock().is_complete());
            self.cleanup_requested = false;
        }

        self.process_file_events();
    }

    fn pump_network(&mut self) {
        for (client_id, frame) in self.network.pump() {
            match MessageId::from_u32(frame.message_id) {
                Some(MessageId::RequestResource) => match frame.parse_resource_request() {
                    Ok(request) => {
                        for resource_id in request.resource_ids {
                            self.create_request(
                                resource_id,
                                client_id,
                                RequestOrigin::External,
                                "",
                            );
                        }
                    }
                    Err(e) => warn!(client_id, error = %e, "malformed resource request"),
                },
                _ => debug!(
                    client_id,
                    message_id = frame.message_id,
                    "ignoring unexpected message"
                ),
            }
        }
    }

    fn process_file_events(&mut self) {
        let changed = match self.watcher.as_mut() {
            Some(watcher) => watcher.drain_changed_files(),
            None => return,
        };

        let ctx = self.ctx.clone();
        for path in changed {
            let Ok(relative) = path.strip_prefix(&ctx.source_data_dir) else {
                continue;
            };

            // A file whose extension is a registered resource 4CC names a
            // resource; recompile it directly.
            let named_resource = relative
                .extension()
                .and_then(ResourceTypeId::from_tag)
                .filter(|type_id| ctx.type_registry.is_registered(*type_id))
                .and_then(|_| ResourceId::from_data_path(relative));
            if let Some(resource_id) = named_resource {
                self.create_request(
                    resource_id,
                    0,
                    RequestOrigin::FileWatcher,
                    "External file system change detected!",
                );
                continue;
            }

            // Otherwise it may be a compile dependency of previously seen
            // resources. The dependents list is copied: request creation
            // below mutates the index.
            let dependents = self.dependency_index.dependents_of(&path);
            for dependent in dependents {
                self.create_request(
                    dependent,
                    0,
                    RequestOrigin::FileWatcher,
                    format!("Compile dependency change detected ({path})!"),
                );
            }
        }
    }

    // =========================================================================
    // REAPING & FANOUT
    // =========================================================================

    fn process_completed_requests(&mut self) {
        let clients = self.network.connected_clients();
        let mut buckets: Vec<Bucket> = clients.iter().map(|_| Bucket::default()).collect();
        let exiting = self.ctx.is_exiting();

        let mut index = self.active_tasks.len();
        while index > 0 {
            index -= 1;
            if !self.active_tasks[index].is_finished() {
                continue;
            }

            // No notifications while exiting; a task may also have bailed
            // out pre-spawn, leaving its request pending.
            if !exiting {
                let request = self.active_tasks[index].request().lock();
                assert!(request.is_complete());
                debug!(
                    resource = %request.resource_id,
                    status = ?request.status,
                    "request complete"
                );

                if request.is_internal() {
                    // Up-to-date means nothing changed on disk; nobody
                    // needs to hear about it.
                    if request.status != RequestStatus::SucceededUpToDate {
                        for bucket in &mut buckets {
                            bucket.add_update(&request);
                        }
                    }
                } else if let Some(slot) =
                    clients.iter().position(|id| *id == request.client_id)
                {
                    buckets[slot].add_request_complete(&request);
                }
            }

            self.active_tasks.swap_remove(index);
            self.scheduled_task_count -= 1;
        }

        for (client_id, bucket) in clients.into_iter().zip(buckets) {
            for response in &bucket.update_responses {
                if !response.results.is_empty() {
                    self.network.send(
                        client_id,
                        Frame::resource_response(MessageId::ResourceUpdated, client_id, response),
                    );
                }
            }
            for response in &bucket.request_responses {
                if !response.results.is_empty() {
                    self.network.send(
                        client_id,
                        Frame::resource_response(
                            MessageId::ResourceRequestComplete,
                            client_id,
                            response,
                        ),
                    );
                }
            }
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Drain and dispose. Running compilations finish naturally; queued
    /// tasks observe the exit flag and bail out before spawning anything.
    pub async fn shutdown(&mut self) {
        info!("resource server shutting down");
        self.ctx.begin_exit();

        for task in &mut self.active_tasks {
            task.wait().await;
        }
        self.packaging.shutdown().await;

        // Final reap with notifications suppressed.
        self.process_completed_requests();
        debug_assert_eq!(self.scheduled_task_count, 0);

        self.requests.clear();
        self.watcher = None;
        self.network.shutdown();
    }
}

// =============================================================================
// FANOUT BUCKETS
// =============================================================================

/// Per-client accumulator of outbound result tuples for one tick. A new
/// response object starts whenever the current one holds 64 results.
#[derive(Default)]
struct Bucket {
    update_responses: Vec<ResourceResponse>,
    request_responses: Vec<ResourceResponse>,
}

impl Bucket {
    fn add_update(&mut self, request: &CompilationRequest) {
        push_result(&mut self.update_responses, request);
    }

    fn add_request_complete(&mut self, request: &CompilationRequest) {
        push_result(&mut self.request_responses, request);
    }
}

fn push_result(responses: &mut Vec<ResourceResponse>, request: &CompilationRequest) {
    if responses
        .last()
        .is_none_or(|response| response.results.len() >= RESULTS_PER_RESPONSE)
    {
        responses.push(ResourceResponse::default());
    }

    let result = if request.has_succeeded() {
        ResourceResult {
            resource_id: request.resource_id.clone(),
            file_path: request.destination_file.to_string(),
            log: String::new(),
        }
    } else {
        ResourceResult {
            resource_id: request.resource_id.clone(),
            file_path: String::new(),
            log: request.log.clone(),
        }
    };

    if let Some(response) = responses.last_mut() {
        response.results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_request(n: usize) -> CompilationRequest {
        CompilationRequest {
            resource_id: ResourceId::new(format!("mesh:m{n}.msh")),
            client_id: 0,
            origin: RequestOrigin::FileWatcher,
            compiler_args: format!("m{n}.msh"),
            source_file: Utf8PathBuf::from(format!("/src/m{n}.msh")),
            destination_file: Utf8PathBuf::from(format!("/out/m{n}.msh")),
            status: RequestStatus::Succeeded,
            force_recompilation: false,
            time_started: None,
            time_finished: None,
            log: String::new(),
            extra_info: String::new(),
        }
    }

    #[test]
    fn buckets_chunk_at_sixty_four_results() {
        let mut bucket = Bucket::default();
        for n in 0..130 {
            bucket.add_update(&finished_request(n));
        }

        let sizes: Vec<usize> = bucket
            .update_responses
            .iter()
            .map(|response| response.results.len())
            .collect();
        assert_eq!(sizes, vec![64, 64, 2]);
    }

    #[test]
    fn failed_requests_report_log_not_path() {
        let mut request = finished_request(0);
        request.status = RequestStatus::Failed;
        request.log = "boom".to_string();

        let mut bucket = Bucket::default();
        bucket.add_request_complete(&request);

        let result = &bucket.request_responses[0].results[0];
        assert_eq!(result.file_path, "");
        assert_eq!(result.log, "boom");

        let mut bucket = Bucket::default();
        bucket.add_update(&finished_request(1));
        let result = &bucket.update_responses[0].results[0];
        assert_eq!(result.file_path, "/out/m1.msh");
        assert_eq!(result.log, "");
    }
}
