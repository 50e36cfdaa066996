//! Fixed-width big-endian snapshot layout (version 2, current).
//!
//! ```text
//! capacity u64 | refill_amount u64 | current_tokens u64
//! | period_secs u64 | period_nanos u32
//! | last_refill_secs i64 | last_refill_nanos u32
//! ```

use chrono::DateTime;
use std::time::Duration;

use super::{CodecError, SnapshotFormat};
use crate::ratelimit::Snapshot;

pub const BINARY_VERSION: u8 = 2;

const BODY_LEN: usize = 8 * 3 + 8 + 4 + 8 + 4;
const NANOS_PER_SEC: u32 = 1_000_000_000;

/// The compact binary layout used for new writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFormat;

impl SnapshotFormat for BinaryFormat {
    fn version(&self) -> u8 {
        BINARY_VERSION
    }

    fn write(&self, snapshot: &Snapshot) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(BODY_LEN);
        body.extend_from_slice(&snapshot.capacity.to_be_bytes());
        body.extend_from_slice(&snapshot.refill_amount.to_be_bytes());
        body.extend_from_slice(&snapshot.current_tokens.to_be_bytes());
        body.extend_from_slice(&snapshot.refill_period.as_secs().to_be_bytes());
        body.extend_from_slice(&snapshot.refill_period.subsec_nanos().to_be_bytes());
        body.extend_from_slice(&snapshot.last_refill_at.timestamp().to_be_bytes());
        body.extend_from_slice(&snapshot.last_refill_at.timestamp_subsec_nanos().to_be_bytes());
        Ok(body)
    }

    fn read(&self, body: &[u8]) -> Result<Snapshot, CodecError> {
        if body.len() > BODY_LEN {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes after version {} body",
                body.len() - BODY_LEN,
                BINARY_VERSION
            )));
        }

        let mut reader = Reader { rest: body, total: body.len() };
        let capacity = u64::from_be_bytes(reader.take()?);
        let refill_amount = u64::from_be_bytes(reader.take()?);
        let current_tokens = u64::from_be_bytes(reader.take()?);
        let period_secs = u64::from_be_bytes(reader.take()?);
        let period_nanos = u32::from_be_bytes(reader.take()?);
        let last_refill_secs = i64::from_be_bytes(reader.take()?);
        let last_refill_nanos = u32::from_be_bytes(reader.take()?);

        if period_nanos >= NANOS_PER_SEC {
            return Err(CodecError::Invalid(format!(
                "refill period nanos out of range: {}",
                period_nanos
            )));
        }
        let last_refill_at = DateTime::from_timestamp(last_refill_secs, last_refill_nanos)
            .ok_or_else(|| {
                CodecError::Invalid(format!(
                    "last refill timestamp out of range: {}.{}",
                    last_refill_secs, last_refill_nanos
                ))
            })?;

        Ok(Snapshot {
            capacity,
            refill_period: Duration::new(period_secs, period_nanos),
            refill_amount,
            last_refill_at,
            current_tokens,
        })
    }
}

struct Reader<'a> {
    rest: &'a [u8],
    total: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let (head, rest) = self.rest.split_first_chunk::<N>().ok_or(CodecError::Truncated {
            expected: BODY_LEN,
            actual: self.total,
        })?;
        self.rest = rest;
        Ok(*head)
    }
}
