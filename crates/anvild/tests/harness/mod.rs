//! Test harness for anvild integration tests
//!
//! Provides isolated source/compiled/packaged roots in a temp directory, a
//! scripted stand-in for the external resource compiler, and a minimal
//! framed-protocol client.

#![allow(dead_code)]

use std::time::Duration;

use anvil_proto::{
    COMPILATION_LOG_DELIMITER, Frame, MessageId, ResourceId, ResourceRequest, ResourceResponse,
};
use anvild::net::{read_frame, write_frame};
use anvild::server::{Collaborators, ResourceServer};
use anvild::settings::ServerSettings;
use camino::Utf8PathBuf;
use tempfile::TempDir;
use tokio::net::TcpStream;

pub struct TestEnv {
    _root: TempDir,
    pub source_dir: Utf8PathBuf,
    pub compiled_dir: Utf8PathBuf,
    pub packaged_dir: Utf8PathBuf,
    pub compiler_path: Utf8PathBuf,
    pub invocations_path: Utf8PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().expect("failed to create temp dir");
        let base =
            Utf8PathBuf::from_path_buf(root.path().to_path_buf()).expect("non-utf8 temp dir");
        let env = Self {
            source_dir: base.join("source"),
            compiled_dir: base.join("compiled"),
            packaged_dir: base.join("packaged"),
            compiler_path: base.join("resource-compiler"),
            invocations_path: base.join("invocations.log"),
            _root: root,
        };
        std::fs::create_dir_all(env.source_dir.as_std_path()).expect("failed to create source dir");
        env
    }

    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            source_data_dir: self.source_dir.clone(),
            compiled_resource_dir: self.compiled_dir.clone(),
            packaged_build_dir: self.packaged_dir.clone(),
            compiler_executable: self.compiler_path.clone(),
            port: 0,
            worker_count: 2,
        }
    }

    /// Install a scripted compiler that records its argv, prints a preamble
    /// followed by the log delimiter and a payload line, then exits with
    /// `exit_code`.
    pub fn install_compiler(&self, exit_code: i32) {
        self.install_compiler_with(exit_code, "compiled ok");
    }

    pub fn install_compiler_with(&self, exit_code: i32, payload: &str) {
        let script = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> {invocations}\n\
             echo \"resource compiler v0.1\"\n\
             echo \"{delimiter}\"\n\
             echo \"{payload}\"\n\
             exit {exit_code}\n",
            invocations = self.invocations_path,
            delimiter = COMPILATION_LOG_DELIMITER,
            payload = payload,
            exit_code = exit_code,
        );
        self.write_script(&script);
    }

    /// A compiler that sleeps before succeeding; for shutdown draining.
    pub fn install_slow_compiler(&self, seconds: f32) {
        let script = format!(
            "#!/bin/sh\n\
             echo \"$@\" >> {invocations}\n\
             sleep {seconds}\n\
             exit 0\n",
            invocations = self.invocations_path,
            seconds = seconds,
        );
        self.write_script(&script);
    }

    fn write_script(&self, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(self.compiler_path.as_std_path(), script).expect("failed to write compiler");
        std::fs::set_permissions(
            self.compiler_path.as_std_path(),
            std::fs::Permissions::from_mode(0o755),
        )
        .expect("failed to chmod compiler");
    }

    /// The argv of every compiler invocation so far, one line each.
    pub fn invocations(&self) -> Vec<String> {
        std::fs::read_to_string(self.invocations_path.as_std_path())
            .map(|raw| raw.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn write_source(&self, relative: &str, contents: &str) {
        let path = self.source_dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.as_std_path()).expect("failed to create parent dirs");
        }
        std::fs::write(path.as_std_path(), contents).expect("failed to write source file");
    }

    pub async fn start_server(&self, collaborators: Collaborators) -> ResourceServer {
        ResourceServer::initialize(self.settings(), collaborators)
            .await
            .expect("server failed to initialize")
    }
}

/// Tick the server until `pred` holds, panicking after a generous deadline.
pub async fn run_until(
    server: &mut ResourceServer,
    what: &str,
    mut pred: impl FnMut(&ResourceServer) -> bool,
) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        server.update().await;
        if pred(server) {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Keep ticking for a fixed window; for proving nothing further happens.
pub async fn run_for(server: &mut ResourceServer, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        server.update().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A client speaking the framed protocol against an in-process server.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(server: &ResourceServer) -> Self {
        let addr = ("127.0.0.1", server.local_addr().port());
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self { stream }
    }

    pub async fn request(&mut self, resource_ids: &[&str]) {
        let request = ResourceRequest {
            resource_ids: resource_ids.iter().map(|id| ResourceId::new(*id)).collect(),
        };
        // The client-side id field is ignored; the server stamps its own.
        write_frame(&mut self.stream, &Frame::resource_request(0, &request))
            .await
            .expect("failed to send request");
    }

    /// Receive the next response frame.
    pub async fn recv(&mut self) -> (MessageId, ResourceResponse) {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a response frame")
            .expect("read error")
            .expect("connection closed");
        let message_id = MessageId::from_u32(frame.message_id).expect("unknown message id");
        let response = frame
            .parse_resource_response()
            .expect("malformed response payload");
        (message_id, response)
    }

    /// Assert that no frame arrives within `duration`.
    pub async fn expect_no_message(&mut self, duration: Duration) {
        match tokio::time::timeout(duration, read_frame(&mut self.stream)).await {
            Err(_) => {}
            Ok(Ok(None)) => {}
            Ok(Ok(Some(frame))) => panic!("unexpected frame with message id {}", frame.message_id),
            Ok(Err(_)) => {}
        }
    }
}
