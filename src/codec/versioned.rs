//! Version-byte dispatch over registered snapshot formats.

use std::collections::HashMap;
use tracing::trace;

use super::binary::BinaryFormat;
use super::gzip_json::GzipJsonFormat;
use super::{validate, CodecError, SnapshotCodec, SnapshotFormat};
use crate::ratelimit::Snapshot;

/// A codec that writes one format and reads every registered one.
pub struct VersionedCodec {
    /// Version used for new writes
    current: u8,
    /// Version byte to format
    formats: HashMap<u8, Box<dyn SnapshotFormat>>,
}

impl VersionedCodec {
    /// Create a codec that writes (and reads) `current`.
    pub fn new(current: Box<dyn SnapshotFormat>) -> Self {
        let version = current.version();
        let mut formats: HashMap<u8, Box<dyn SnapshotFormat>> = HashMap::new();
        formats.insert(version, current);
        Self {
            current: version,
            formats,
        }
    }

    /// Make another format readable. A format with the same version byte
    /// replaces the one already registered.
    pub fn register(mut self, format: Box<dyn SnapshotFormat>) -> Self {
        self.formats.insert(format.version(), format);
        self
    }

    /// The production codec: writes the binary layout, still reads gzip JSON.
    pub fn standard() -> Self {
        Self::new(Box::new(BinaryFormat)).register(Box::new(GzipJsonFormat))
    }

    pub fn current_version(&self) -> u8 {
        self.current
    }

    /// Whether payloads with this version byte can be decoded.
    pub fn supports(&self, version: u8) -> bool {
        self.formats.contains_key(&version)
    }
}

impl Default for VersionedCodec {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for VersionedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut versions: Vec<u8> = self.formats.keys().copied().collect();
        versions.sort_unstable();
        f.debug_struct("VersionedCodec")
            .field("current", &self.current)
            .field("versions", &versions)
            .finish()
    }
}

impl SnapshotCodec for VersionedCodec {
    fn encode(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
        let format = self
            .formats
            .get(&self.current)
            .ok_or(CodecError::UnknownVersion(self.current))?;

        let body = format.write(snapshot)?;
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(self.current);
        payload.extend_from_slice(&body);
        Ok(payload)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Snapshot, CodecError> {
        let (&version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        let format = self
            .formats
            .get(&version)
            .ok_or(CodecError::UnknownVersion(version))?;

        trace!(version = version, len = bytes.len(), "Decoding snapshot");
        let snapshot = format.read(body)?;
        validate(&snapshot)?;
        Ok(snapshot)
    }
}
