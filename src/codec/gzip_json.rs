//! Gzip-compressed JSON snapshot layout (version 1, legacy).
//!
//! Buckets written by older deployments use this layout and may still sit in
//! the store until their TTL lapses.

use chrono::DateTime;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

use super::{CodecError, SnapshotFormat};
use crate::ratelimit::Snapshot;

pub const GZIP_JSON_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    capacity: u64,
    refill_period: Duration,
    refill_amount: u64,
    last_refill_secs: i64,
    last_refill_nanos: u32,
    current_tokens: u64,
}

/// JSON document compressed with gzip.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipJsonFormat;

impl SnapshotFormat for GzipJsonFormat {
    fn version(&self) -> u8 {
        GZIP_JSON_VERSION
    }

    fn write(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
        let document = Document {
            capacity: snapshot.capacity,
            refill_period: snapshot.refill_period,
            refill_amount: snapshot.refill_amount,
            last_refill_secs: snapshot.last_refill_at.timestamp(),
            last_refill_nanos: snapshot.last_refill_at.timestamp_subsec_nanos(),
            current_tokens: snapshot.current_tokens,
        };
        let json = serde_json::to_vec(&document)?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn read(&self, body: &[u8]) -> Result<Snapshot, CodecError> {
        let mut json = Vec::new();
        GzDecoder::new(body).read_to_end(&mut json)?;
        let document: Document = serde_json::from_slice(&json)?;

        let last_refill_at =
            DateTime::from_timestamp(document.last_refill_secs, document.last_refill_nanos)
                .ok_or_else(|| {
                    CodecError::Invalid("last refill timestamp out of range".to_string())
                })?;

        Ok(Snapshot {
            capacity: document.capacity,
            refill_period: document.refill_period,
            refill_amount: document.refill_amount,
            last_refill_at,
            current_tokens: document.current_tokens,
        })
    }
}
