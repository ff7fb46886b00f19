//! Resource server protocol definitions
//!
//! Everything the server and its clients (and the external resource
//! compiler) must agree on:
//! - resource identifiers and their path resolution rules
//! - the compiler's exit-code contract and log delimiter
//! - the wire frame layout and message payloads
//!
//! The daemon is the brain; clients are thin. This crate carries no I/O:
//! frames are encoded to / decoded from byte buffers and the transport
//! moves them.

use camino::{Utf8Component, Utf8Path};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// RESOURCE IDENTIFIERS
// =============================================================================

/// A four-character resource type tag ("msh", "map", "anim", ...).
///
/// Stored zero-padded; one to four lowercase ASCII alphanumerics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceTypeId([u8; 4]);

impl ResourceTypeId {
    /// The entity-map descriptor type, the root of every packaging run.
    pub const MAP: ResourceTypeId = ResourceTypeId(*b"map\0");

    /// Parse a type tag. Accepts one to four ASCII alphanumerics,
    /// case-insensitively; stored lowercased.
    pub fn from_tag(tag: &str) -> Option<Self> {
        if tag.is_empty() || tag.len() > 4 {
            return None;
        }
        let mut fourcc = [0u8; 4];
        for (slot, byte) in fourcc.iter_mut().zip(tag.bytes()) {
            if !byte.is_ascii_alphanumeric() {
                return None;
            }
            *slot = byte.to_ascii_lowercase();
        }
        Some(Self(fourcc))
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|b| *b == 0).unwrap_or(4);
        // Only ASCII bytes are ever stored.
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl std::fmt::Display for ResourceTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A canonical resource identifier: `type_tag:virtual/path/to/file.ext`.
///
/// The string may hold anything a client sent us. Validity is a query, not
/// a construction-time guarantee, so invalid identifiers can round-trip
/// through failure responses unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Build an identifier from a type tag and a data path.
    pub fn from_parts(type_id: ResourceTypeId, data_path: &Utf8Path) -> Self {
        Self(format!("{}:{}", type_id, data_path))
    }

    /// Build an identifier from a source-relative data path, deriving the
    /// type tag from the file extension. This is the file-watcher rule: a
    /// file whose extension is a valid type 4CC names a resource directly.
    pub fn from_data_path(data_path: &Utf8Path) -> Option<Self> {
        let type_id = ResourceTypeId::from_tag(data_path.extension()?)?;
        let id = Self::from_parts(type_id, data_path);
        id.is_valid().then_some(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.parts().is_some()
    }

    pub fn type_id(&self) -> Option<ResourceTypeId> {
        self.parts().map(|(type_id, _)| type_id)
    }

    /// The virtual path relative to the source-data root.
    pub fn data_path(&self) -> Option<&Utf8Path> {
        self.parts().map(|(_, path)| path)
    }

    /// Absolute path of the source descriptor under the source-data root.
    pub fn source_path(&self, source_root: &Utf8Path) -> Option<camino::Utf8PathBuf> {
        Some(source_root.join(self.data_path()?))
    }

    /// Absolute path of the compiled artifact under the given output root.
    /// The source tree is mirrored by data path into each output root.
    pub fn destination_path(&self, output_root: &Utf8Path) -> Option<camino::Utf8PathBuf> {
        Some(output_root.join(self.data_path()?))
    }

    fn parts(&self) -> Option<(ResourceTypeId, &Utf8Path)> {
        let (tag, rest) = self.0.split_once(':')?;
        let type_id = ResourceTypeId::from_tag(tag)?;
        if rest.is_empty() {
            return None;
        }
        let path = Utf8Path::new(rest);
        if !path
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_)))
        {
            return None;
        }
        path.file_name()?;
        path.extension()?;
        Some((type_id, path))
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

// =============================================================================
// COMPILER CONTRACT
// =============================================================================

/// Exit codes of the external resource compiler. Any other exit code (or
/// death by signal) means the compilation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationResult {
    Success,
    SuccessWithWarnings,
    SuccessUpToDate,
}

impl CompilationResult {
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::SuccessWithWarnings),
            2 => Some(Self::SuccessUpToDate),
            _ => None,
        }
    }

    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::SuccessWithWarnings => 1,
            Self::SuccessUpToDate => 2,
        }
    }
}

/// Sentinel the compiler prints between its own preamble and the payload
/// log. The server strips everything up to and including the first
/// occurrence, plus the separator byte that follows it.
pub const COMPILATION_LOG_DELIMITER: &str = "----------------------------------------";

/// Strip the compiler preamble from a captured log.
pub fn strip_log_preamble(log: &str) -> &str {
    match log.find(COMPILATION_LOG_DELIMITER) {
        Some(pos) => {
            let cut = pos + COMPILATION_LOG_DELIMITER.len() + 1;
            log.get(cut..).unwrap_or("")
        }
        None => log,
    }
}

// =============================================================================
// WIRE PROTOCOL
// =============================================================================

/// Connection identifier minted by the transport. 0 is reserved for
/// server-internal request origins and never assigned to a client.
pub type ClientId = u32;

/// Frames larger than this are rejected by the transport.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Message kinds carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    /// Client -> server: compile these resources.
    RequestResource = 1,
    /// Server -> every client: an internally triggered recompile landed.
    ResourceUpdated = 2,
    /// Server -> originating client: your request finished.
    ResourceRequestComplete = 3,
}

impl MessageId {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::RequestResource),
            2 => Some(Self::ResourceUpdated),
            3 => Some(Self::ResourceRequestComplete),
            _ => None,
        }
    }

    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Payload of `RequestResource`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub resource_ids: Vec<ResourceId>,
}

/// One completed compilation, as reported to a client. Success carries the
/// destination path and an empty log; failure carries an empty path and the
/// captured compiler log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub resource_id: ResourceId,
    pub file_path: String,
    pub log: String,
}

/// Payload of `ResourceUpdated` and `ResourceRequestComplete`. Never holds
/// more than 64 results; the server starts a fresh response when a bucket
/// fills up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub results: Vec<ResourceResult>,
}

/// A single transport frame.
///
/// Layout, little-endian:
///
/// ```text
/// [u32 frame_len][u32 message_id][u32 client_id][payload bytes]
/// ```
///
/// `frame_len` counts everything after itself. Payloads are JSON documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u32,
    pub client_id: ClientId,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_id: MessageId, client_id: ClientId, payload: Vec<u8>) -> Self {
        Self {
            message_id: message_id.as_u32(),
            client_id,
            payload,
        }
    }

    pub fn resource_request(client_id: ClientId, request: &ResourceRequest) -> Self {
        Self::new(
            MessageId::RequestResource,
            client_id,
            to_payload(request),
        )
    }

    pub fn resource_response(
        message_id: MessageId,
        client_id: ClientId,
        response: &ResourceResponse,
    ) -> Self {
        Self::new(message_id, client_id, to_payload(response))
    }

    /// Encode the full frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 8 + self.payload.len();
        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&self.message_id.to_le_bytes());
        buf.extend_from_slice(&self.client_id.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame body (the bytes after the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 8 {
            return Err(ProtocolError::TruncatedFrame(body.len()));
        }
        let message_id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let client_id = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        Ok(Self {
            message_id,
            client_id,
            payload: body[8..].to_vec(),
        })
    }

    pub fn parse_resource_request(&self) -> Result<ResourceRequest, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::MalformedPayload {
            kind: "resource request",
            source,
        })
    }

    pub fn parse_resource_response(&self) -> Result<ResourceResponse, ProtocolError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtocolError::MalformedPayload {
            kind: "resource response",
            source,
        })
    }
}

fn to_payload<T: Serialize>(value: &T) -> Vec<u8> {
    // These payload types serialize infallibly.
    serde_json::to_vec(value).unwrap_or_default()
}

/// Errors raised while decoding frames or payloads.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame body too short ({0} bytes)")]
    TruncatedFrame(usize),

    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(u32),

    #[error("unknown message id {0}")]
    UnknownMessageId(u32),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn type_tag_parsing() {
        assert_eq!(ResourceTypeId::from_tag("msh").unwrap().as_str(), "msh");
        assert_eq!(ResourceTypeId::from_tag("MESH").unwrap().as_str(), "mesh");
        assert!(ResourceTypeId::from_tag("").is_none());
        assert!(ResourceTypeId::from_tag("toolong").is_none());
        assert!(ResourceTypeId::from_tag("m.h").is_none());
        assert_eq!(ResourceTypeId::MAP.as_str(), "map");
        assert_eq!(ResourceTypeId::MAP, ResourceTypeId::from_tag("map").unwrap());
    }

    #[test]
    fn resource_id_validity() {
        assert!(ResourceId::new("mesh:a/b.msh").is_valid());
        assert!(ResourceId::new("map:world.map").is_valid());

        // The tag is the declared type, not necessarily the extension.
        let id = ResourceId::new("mesh:a/b.msh");
        assert_eq!(id.type_id().unwrap().as_str(), "mesh");
        assert_eq!(id.data_path().unwrap(), Utf8Path::new("a/b.msh"));

        assert!(!ResourceId::new(":/").is_valid());
        assert!(!ResourceId::new("").is_valid());
        assert!(!ResourceId::new("mesh:").is_valid());
        assert!(!ResourceId::new("mesh:/abs/path.msh").is_valid());
        assert!(!ResourceId::new("mesh:../escape.msh").is_valid());
        assert!(!ResourceId::new("mesh:noextension").is_valid());
        assert!(!ResourceId::new("no-colon-here").is_valid());
    }

    #[test]
    fn resource_id_path_resolution() {
        let id = ResourceId::new("mesh:a/b.msh");
        assert_eq!(
            id.source_path(Utf8Path::new("/data/source")).unwrap(),
            Utf8PathBuf::from("/data/source/a/b.msh")
        );
        assert_eq!(
            id.destination_path(Utf8Path::new("/data/compiled")).unwrap(),
            Utf8PathBuf::from("/data/compiled/a/b.msh")
        );
        assert!(ResourceId::new(":/").source_path(Utf8Path::new("/data")).is_none());
    }

    #[test]
    fn resource_id_from_data_path() {
        let id = ResourceId::from_data_path(Utf8Path::new("a/b.msh")).unwrap();
        assert_eq!(id.as_str(), "msh:a/b.msh");
        assert_eq!(id.type_id().unwrap().as_str(), "msh");

        // Extensions that are not valid 4CCs do not name resources.
        assert!(ResourceId::from_data_path(Utf8Path::new("a/b.shader")).is_none());
        assert!(ResourceId::from_data_path(Utf8Path::new("a/noext")).is_none());
    }

    #[test]
    fn exit_code_mapping() {
        assert_eq!(
            CompilationResult::from_exit_code(0),
            Some(CompilationResult::Success)
        );
        assert_eq!(
            CompilationResult::from_exit_code(1),
            Some(CompilationResult::SuccessWithWarnings)
        );
        assert_eq!(
            CompilationResult::from_exit_code(2),
            Some(CompilationResult::SuccessUpToDate)
        );
        assert_eq!(CompilationResult::from_exit_code(3), None);
        assert_eq!(CompilationResult::from_exit_code(-1), None);
        assert_eq!(CompilationResult::Success.exit_code(), 0);
    }

    #[test]
    fn log_preamble_stripping() {
        let log = format!(
            "preamble line\n{}\npayload line\n",
            COMPILATION_LOG_DELIMITER
        );
        assert_eq!(strip_log_preamble(&log), "payload line\n");

        // No delimiter: log passes through untouched.
        assert_eq!(strip_log_preamble("plain output"), "plain output");

        // Delimiter at the very end: nothing left after the strip.
        let log = format!("preamble\n{}", COMPILATION_LOG_DELIMITER);
        assert_eq!(strip_log_preamble(&log), "");

        // Only the first occurrence is stripped.
        let log = format!(
            "{}\nkept {}\n",
            COMPILATION_LOG_DELIMITER, COMPILATION_LOG_DELIMITER
        );
        assert_eq!(
            strip_log_preamble(&log),
            format!("kept {}\n", COMPILATION_LOG_DELIMITER)
        );
    }

    #[test]
    fn frame_roundtrip() {
        let request = ResourceRequest {
            resource_ids: vec![ResourceId::new("mesh:a/b.msh"), ResourceId::new(":/")],
        };
        let frame = Frame::resource_request(7, &request);
        let encoded = frame.encode();

        let len = u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(len, encoded.len() - 4);

        let decoded = Frame::decode_body(&encoded[4..]).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.client_id, 7);
        assert_eq!(
            MessageId::from_u32(decoded.message_id),
            Some(MessageId::RequestResource)
        );

        let parsed = decoded.parse_resource_request().unwrap();
        assert_eq!(parsed.resource_ids.len(), 2);
        // Invalid identifiers survive the round trip for failure reporting.
        assert_eq!(parsed.resource_ids[1].as_str(), ":/");
    }

    #[test]
    fn truncated_frame_rejected() {
        assert!(matches!(
            Frame::decode_body(&[1, 2, 3]),
            Err(ProtocolError::TruncatedFrame(3))
        ));
    }

    #[test]
    fn response_payload_roundtrip() {
        let response = ResourceResponse {
            results: vec![ResourceResult {
                resource_id: ResourceId::new("mesh:a/b.msh"),
                file_path: "/out/a/b.msh".to_string(),
                log: String::new(),
            }],
        };
        let frame = Frame::resource_response(MessageId::ResourceUpdated, 3, &response);
        let parsed = frame.parse_resource_response().unwrap();
        assert_eq!(parsed.results, response.results);
    }
}
