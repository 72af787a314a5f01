//! Docid map: dense u32 document identifiers to path strings.
//!
//! On disk: `doc_count: u32 LE`, an offsets array of `doc_count` u32 entries
//! (relative to the path table), then the path table of u16-length-prefixed
//! UTF-8 paths. The offsets array makes `lookup` O(1) on the mapped region.

use anyhow::Result;

use crate::error::Error;

/// Accumulates docid assignments during index construction. Docids are
/// handed out in append order, so a deterministic visit order yields a
/// deterministic map.
#[derive(Debug, Default)]
pub struct DocidMapWriter {
    paths: Vec<String>,
    frozen: bool,
}

impl DocidMapWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, path: &str) -> Result<u32> {
        if self.frozen {
            return Err(Error::AlreadyFrozen.into());
        }
        if path.len() > u16::MAX as usize {
            return Err(Error::Corrupt(format!("path too long: {} bytes", path.len())).into());
        }
        let docid = self.paths.len() as u32;
        self.paths.push(path.to_string());
        Ok(docid)
    }

    pub fn count(&self) -> usize {
        self.paths.len()
    }

    /// Serialize the map and freeze the writer; later appends fail.
    pub fn serialize(&mut self) -> Vec<u8> {
        self.frozen = true;
        let mut offsets = Vec::with_capacity(self.paths.len());
        let mut table: Vec<u8> = Vec::new();
        for p in &self.paths {
            offsets.push(table.len() as u32);
            table.extend_from_slice(&(p.len() as u16).to_le_bytes());
            table.extend_from_slice(p.as_bytes());
        }
        let mut out = Vec::with_capacity(4 + offsets.len() * 4 + table.len());
        out.extend_from_slice(&(self.paths.len() as u32).to_le_bytes());
        for off in offsets {
            out.extend_from_slice(&off.to_le_bytes());
        }
        out.extend_from_slice(&table);
        out
    }
}

/// Zero-copy view over a serialized docid map region.
#[derive(Debug, Clone, Copy)]
pub struct DocidMapView<'a> {
    count: u32,
    offsets: &'a [u8],
    table: &'a [u8],
}

impl<'a> DocidMapView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::Corrupt("docid map shorter than its header".into()).into());
        }
        let count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let offsets_len = (count as usize)
            .checked_mul(4)
            .ok_or_else(|| Error::Corrupt("docid map count overflows".into()))?;
        if data.len() < 4 + offsets_len {
            return Err(Error::Corrupt("docid map offsets array truncated".into()).into());
        }
        Ok(DocidMapView {
            count,
            offsets: &data[4..4 + offsets_len],
            table: &data[4 + offsets_len..],
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn lookup(&self, docid: u32) -> Result<&'a str> {
        if docid >= self.count {
            return Err(Error::OutOfRange(docid).into());
        }
        let i = docid as usize * 4;
        let off = u32::from_le_bytes(self.offsets[i..i + 4].try_into().unwrap()) as usize;
        if off + 2 > self.table.len() {
            return Err(Error::Corrupt(format!("path offset {} out of bounds", off)).into());
        }
        let len = u16::from_le_bytes(self.table[off..off + 2].try_into().unwrap()) as usize;
        let start = off + 2;
        if start + len > self.table.len() {
            return Err(Error::Corrupt(format!("path entry at {} truncated", off)).into());
        }
        std::str::from_utf8(&self.table[start..start + len])
            .map_err(|_| Error::Corrupt(format!("path for docid {} not valid UTF-8", docid)).into())
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<&'a str>> + '_ {
        (0..self.count).map(move |d| self.lookup(d))
    }
}
