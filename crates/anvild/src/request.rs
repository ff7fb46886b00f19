//! Compilation request records.
//!
//! A request is created by the server, mutated by the worker task that owns
//! it while it is `Compiling`, and handed back to the driver once the task
//! finishes. The shared handle makes that handoff explicit; the driver only
//! re-reads a request after observing its task's completion.

use std::sync::Arc;
use std::time::Instant;

use anvil_proto::{ClientId, ResourceId};
use camino::Utf8PathBuf;
use parking_lot::Mutex;

/// Where a request came from. The origin decides the destination root, the
/// extra compiler flag and the fanout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// A connected client asked for the resource.
    External,
    /// The file watcher noticed a source change.
    FileWatcher,
    /// The packaging engine is building the shipping tree.
    Package,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Compiling,
    SucceededUpToDate,
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

impl RequestStatus {
    /// Terminal states: everything except `Pending` and `Compiling`.
    pub fn is_complete(self) -> bool {
        !matches!(self, Self::Pending | Self::Compiling)
    }

    pub fn has_succeeded(self) -> bool {
        matches!(
            self,
            Self::SucceededUpToDate | Self::Succeeded | Self::SucceededWithWarnings
        )
    }
}

#[derive(Debug)]
pub struct CompilationRequest {
    pub resource_id: ResourceId,
    /// 0 for server-internal requests.
    pub client_id: ClientId,
    pub origin: RequestOrigin,
    /// The resource data path handed to the compiler command line.
    pub compiler_args: String,
    pub source_file: Utf8PathBuf,
    pub destination_file: Utf8PathBuf,
    pub status: RequestStatus,
    /// Pass `-force` to the compiler. Never set on Package-origin requests,
    /// which pass `-package` instead.
    pub force_recompilation: bool,
    pub time_started: Option<Instant>,
    pub time_finished: Option<Instant>,
    /// Compiler output, preamble stripped.
    pub log: String,
    /// Human-readable cause, e.g. which dependency changed.
    pub extra_info: String,
}

impl CompilationRequest {
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }

    pub fn has_succeeded(&self) -> bool {
        self.status.has_succeeded()
    }

    /// Internal requests broadcast to every client; external requests
    /// answer their originator only.
    pub fn is_internal(&self) -> bool {
        self.origin != RequestOrigin::External
    }

    pub fn compilation_time(&self) -> Option<std::time::Duration> {
        match (self.time_started, self.time_finished) {
            (Some(started), Some(finished)) => Some(finished.duration_since(started)),
            _ => None,
        }
    }
}

/// Requests are shared between the driver and the worker task that runs
/// them; see the module docs for who may touch one when.
pub type SharedRequest = Arc<Mutex<CompilationRequest>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!RequestStatus::Pending.is_complete());
        assert!(!RequestStatus::Compiling.is_complete());
        assert!(RequestStatus::SucceededUpToDate.is_complete());
        assert!(RequestStatus::Succeeded.is_complete());
        assert!(RequestStatus::SucceededWithWarnings.is_complete());
        assert!(RequestStatus::Failed.is_complete());
    }

    #[test]
    fn success_states() {
        assert!(RequestStatus::SucceededUpToDate.has_succeeded());
        assert!(RequestStatus::Succeeded.has_succeeded());
        assert!(RequestStatus::SucceededWithWarnings.has_succeeded());
        assert!(!RequestStatus::Failed.has_succeeded());
        assert!(!RequestStatus::Pending.has_succeeded());
        assert!(!RequestStatus::Compiling.has_succeeded());
    }
}
