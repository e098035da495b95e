//! CAR (Content-Addressable aRchive) framing.
//!
//! A CAR file is a varint-length-prefixed DAG-CBOR header followed by
//! varint-length-prefixed sections, each a binary CID and the block bytes it
//! addresses.

use std::collections::HashMap;
use std::io::Cursor;

use ipld_core::cid::Cid;
use serde::Deserialize;

use crate::PinakesError;
use crate::Result;

#[derive(Debug, Deserialize)]
struct CarHeader {
    version: u64,
    roots: Vec<Cid>,
}

#[derive(Debug)]
pub struct CarArchive {
    pub roots: Vec<Cid>,
    pub blocks: HashMap<Cid, Vec<u8>>,
}

impl CarArchive {
    /// Parse the archive framing into a content-addressed block map.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0usize;

        let header_len = read_varint(bytes, &mut pos)?;
        let header_end = pos
            .checked_add(usize::try_from(header_len).map_err(|_| oversized("header"))?)
            .ok_or_else(|| oversized("header"))?;
        if header_end > bytes.len() {
            return Err(PinakesError::MalformedRepo("truncated CAR header".into()));
        }
        let header: CarHeader = serde_ipld_dagcbor::from_slice(&bytes[pos..header_end])
            .map_err(|e| PinakesError::MalformedRepo(format!("CAR header decode: {e}")))?;
        if header.version != 1 {
            return Err(PinakesError::MalformedRepo(format!(
                "unsupported CAR version {}",
                header.version
            )));
        }
        pos = header_end;

        let mut blocks = HashMap::new();
        while pos < bytes.len() {
            let section_len = read_varint(bytes, &mut pos)?;
            let section_end = pos
                .checked_add(usize::try_from(section_len).map_err(|_| oversized("section"))?)
                .ok_or_else(|| oversized("section"))?;
            if section_end > bytes.len() {
                return Err(PinakesError::MalformedRepo("truncated CAR section".into()));
            }
            let mut cursor = Cursor::new(&bytes[pos..section_end]);
            let cid = Cid::read_bytes(&mut cursor)
                .map_err(|e| PinakesError::MalformedRepo(format!("bad CID in CAR: {e}")))?;
            let data_start = pos + usize::try_from(cursor.position()).expect("cursor fits usize");
            blocks.insert(cid, bytes[data_start..section_end].to_vec());
            pos = section_end;
        }

        Ok(Self {
            roots: header.roots,
            blocks,
        })
    }
}

fn oversized(what: &str) -> PinakesError {
    PinakesError::MalformedRepo(format!("oversized CAR {what} length"))
}

/// Unsigned LEB128.
fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| PinakesError::MalformedRepo("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(PinakesError::MalformedRepo("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// LEB128 encoder, used by the decoder tests to synthesize archives.
#[cfg(test)]
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u64::from(u32::MAX)] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn truncated_varint_is_an_error() {
        let mut pos = 0;
        assert!(read_varint(&[0x80], &mut pos).is_err());
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(CarArchive::parse(&[]).is_err());
    }
}
