//! Reassembly of chunked SSID lists
//!
//! The lamp sends every network name as one or more chunks and waits for an
//! ack after each one. Chunks are concatenated as raw bytes and decoded only
//! once the list is complete, since a chunk boundary may fall in the middle of
//! a multi-byte character.
//!
//! Indices that never arrive are skipped: a list with indices 0 and 2 yields
//! two names, not three with an empty placeholder.

use std::collections::{BTreeMap, BTreeSet};

use linkedlamp_proto::SsidChunk;
use log::{debug, warn};

/// Acknowledgement the session must write back for a received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub ssid_index: u8,
    pub chunk_index: u8,
}

#[derive(Debug, Default)]
struct PartialSsid {
    bytes: Vec<u8>,
    chunks: BTreeSet<u8>,
}

#[derive(Debug, Default)]
pub struct SsidAssembler {
    ssids: BTreeMap<u8, PartialSsid>,
}

impl SsidAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.ssids.clear();
    }

    /// Append a chunk to its SSID and return the ack to send.
    ///
    /// Every chunk is acked, even a repeated or out-of-range one, so the
    /// device never stalls waiting for us. Repeated chunks are not appended
    /// twice.
    pub fn add_chunk(
        &mut self,
        ssid_index: u8,
        chunk_index: u8,
        chunk_count: u8,
        data: &[u8],
    ) -> Ack {
        if chunk_index >= chunk_count {
            warn!("SSID {ssid_index}: chunk {chunk_index} out of range (count {chunk_count})");
        }

        let partial = self.ssids.entry(ssid_index).or_default();
        if partial.chunks.insert(chunk_index) {
            partial.bytes.extend_from_slice(data);
            debug!(
                "SSID {ssid_index}: chunk {}/{chunk_count} ({} bytes)",
                chunk_index + 1,
                data.len()
            );
        } else {
            warn!("SSID {ssid_index}: chunk {chunk_index} received twice, ignored");
        }

        Ack {
            ssid_index,
            chunk_index,
        }
    }

    pub fn add(&mut self, chunk: &SsidChunk) -> Ack {
        self.add_chunk(
            chunk.ssid_index,
            chunk.chunk_index,
            chunk.chunk_count,
            &chunk.data,
        )
    }

    /// Number of distinct SSID indices seen so far
    pub fn len(&self) -> usize {
        self.ssids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ssids.is_empty()
    }

    /// Decode every SSID, ascending by index, and clear the accumulator.
    ///
    /// Invalid UTF-8 is replaced rather than failing the whole list.
    pub fn finalize(&mut self) -> Vec<String> {
        std::mem::take(&mut self.ssids)
            .into_values()
            .map(|partial| String::from_utf8_lossy(&partial.bytes).into_owned())
            .collect()
    }
}
