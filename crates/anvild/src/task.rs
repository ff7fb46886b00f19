//! The compilation worker pool.
//!
//! A fixed number of permits bounds how many compiler child processes run
//! at once. Each task owns its request for the duration of the compile; the
//! driver polls `is_finished` each tick and only reads the request back
//! after that observation.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use anvil_proto::{CompilationResult, strip_log_preamble};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::request::{RequestOrigin, RequestStatus, SharedRequest};
use crate::server::ServerContext;
use crate::settings::MIN_WORKER_COUNT;

/// Compiler output is drained in chunks of this many bytes until EOF.
const LOG_READ_CHUNK: usize = 512;

pub struct CompilerPool {
    semaphore: Arc<Semaphore>,
}

impl CompilerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(worker_count.max(MIN_WORKER_COUNT))),
        }
    }

    /// Hand a request to the pool. The returned task is the driver's handle
    /// for polling completion and reaping.
    pub fn spawn(&self, ctx: Arc<ServerContext>, request: SharedRequest) -> CompilationTask {
        let semaphore = self.semaphore.clone();
        let task_request = request.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            run_compilation(ctx, task_request).await;
        });
        CompilationTask { request, handle }
    }
}

/// One scheduled compilation. Owns the worker task; the request inside is
/// off limits to the driver until `is_finished` reports true.
pub struct CompilationTask {
    request: SharedRequest,
    handle: JoinHandle<()>,
}

impl CompilationTask {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn request(&self) -> &SharedRequest {
        &self.request
    }

    /// Block until the worker finishes. Shutdown-only; running compilations
    /// cannot be aborted.
    pub async fn wait(&mut self) {
        let _ = (&mut self.handle).await;
    }
}

async fn run_compilation(ctx: Arc<ServerContext>, request: SharedRequest) {
    // Synthesized already-failed requests ride the same path for uniform
    // reaping; they (and everything else during shutdown) stop here.
    let args = {
        let mut req = request.lock();
        if ctx.is_exiting() || req.is_complete() {
            return;
        }
        debug_assert!(!req.compiler_args.is_empty());

        let mut args = vec!["-compile".to_string(), req.compiler_args.clone()];
        if req.force_recompilation {
            args.push("-force".to_string());
        } else if req.origin == RequestOrigin::Package {
            args.push("-package".to_string());
        }

        req.status = RequestStatus::Compiling;
        req.time_started = Some(Instant::now());
        args
    };

    let mut child = match Command::new(ctx.compiler_executable.as_str())
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(compiler = %ctx.compiler_executable, error = %e, "compiler failed to spawn");
            fail(&request, "Resource compiler failed to start!");
            return;
        }
    };

    // Both pipes are drained while waiting so the child can never block on
    // a full pipe.
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (exit, out, err) = tokio::join!(child.wait(), drain_pipe(stdout), drain_pipe(stderr));

    let exit = match exit {
        Ok(status) => status,
        Err(e) => {
            warn!(compiler = %ctx.compiler_executable, error = %e, "compiler failed to complete");
            fail(&request, "Resource compiler failed to complete!");
            return;
        }
    };

    let mut combined = out;
    combined.extend_from_slice(&err);
    let combined = String::from_utf8_lossy(&combined);

    let mut req = request.lock();
    req.time_finished = Some(Instant::now());
    req.status = match exit.code().and_then(CompilationResult::from_exit_code) {
        Some(CompilationResult::SuccessUpToDate) => RequestStatus::SucceededUpToDate,
        Some(CompilationResult::Success) => RequestStatus::Succeeded,
        Some(CompilationResult::SuccessWithWarnings) => RequestStatus::SucceededWithWarnings,
        None => RequestStatus::Failed,
    };
    req.log = strip_log_preamble(&combined).to_string();
}

fn fail(request: &SharedRequest, message: &str) {
    let mut req = request.lock();
    req.status = RequestStatus::Failed;
    req.log = message.to_string();
    req.time_finished = Some(Instant::now());
}

async fn drain_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let Some(mut pipe) = pipe else {
        return Vec::new();
    };
    let mut collected = Vec::new();
    let mut buf = [0u8; LOG_READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    collected
}
