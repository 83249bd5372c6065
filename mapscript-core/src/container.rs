use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::header::{Unit, ATTRIBUTE_COUNT, HEADER_SIZE};
use crate::{MapScriptError, Result};

pub type ChunkTag = [u8; 4];

pub const TAG_UNITS: ChunkTag = *b"UNIT";
pub const TAG_CODE: ChunkTag = *b"CODE";
pub const TAG_STRING_POOL: ChunkTag = *b"STRS";
pub const TAG_STRING_OFFSETS: ChunkTag = *b"SOFS";
pub const TAG_VARIABLES: ChunkTag = *b"VARS";
pub const TAG_ATTRIBUTES: ChunkTag = *b"ATTR";
pub const TAG_STORAGE: ChunkTag = *b"STOR";
pub const TAG_TERMINATOR: ChunkTag = *b"END ";

/// Chunks derived entirely from unit contents, in the order they are
/// appended when a container did not already carry them.
const DERIVED_TAGS: [ChunkTag; 7] = [
    TAG_UNITS,
    TAG_CODE,
    TAG_STRING_POOL,
    TAG_STRING_OFFSETS,
    TAG_VARIABLES,
    TAG_ATTRIBUTES,
    TAG_STORAGE,
];

pub(crate) fn tag_name(tag: &ChunkTag) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Chunked map file: `tag[4] | len:u32 BE | payload`, closed by `END `.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapContainer {
    chunks: Vec<(ChunkTag, Vec<u8>)>,
    trailer: Vec<u8>,
}

impl MapContainer {
    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let mut chunks = Vec::new();
        let mut offset = 0usize;

        while offset < raw.len() {
            if offset + 8 > raw.len() {
                let tag_end = (offset + 4).min(raw.len());
                return Err(MapScriptError::TruncatedChunk {
                    tag: String::from_utf8_lossy(&raw[offset..tag_end]).into_owned(),
                    offset,
                });
            }

            let mut tag = [0u8; 4];
            tag.copy_from_slice(&raw[offset..offset + 4]);
            let len = u32::from_be_bytes([
                raw[offset + 4],
                raw[offset + 5],
                raw[offset + 6],
                raw[offset + 7],
            ]) as usize;
            let body_start = offset + 8;

            if tag == TAG_TERMINATOR {
                offset = body_start;
                break;
            }

            let body_end = body_start.checked_add(len).filter(|end| *end <= raw.len());
            let Some(body_end) = body_end else {
                return Err(MapScriptError::TruncatedChunk {
                    tag: tag_name(&tag),
                    offset,
                });
            };

            chunks.push((tag, raw[body_start..body_end].to_vec()));
            offset = body_end;
        }

        let trailer = if offset < raw.len() {
            raw[offset..].to_vec()
        } else {
            Vec::new()
        };

        Ok(Self { chunks, trailer })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total: usize = self.chunks.iter().map(|(_, d)| d.len() + 8).sum();
        let mut out = Vec::with_capacity(total + 8 + self.trailer.len());

        for (tag, data) in &self.chunks {
            let len = u32::try_from(data.len()).map_err(|_| {
                MapScriptError::Bounds(format!(
                    "chunk '{}' exceeds 4 GiB and cannot be stored",
                    tag_name(tag)
                ))
            })?;
            out.extend_from_slice(tag);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(data);
        }

        out.extend_from_slice(&TAG_TERMINATOR);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.trailer);
        Ok(out)
    }

    /// Serialize the whole container in one pass. Nothing is written if
    /// serialization fails.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn chunk(&self, tag: &ChunkTag) -> Option<&[u8]> {
        self.chunks
            .iter()
            .find(|(t, _)| t == tag)
            .map(|(_, d)| d.as_slice())
    }

    pub fn tags(&self) -> impl Iterator<Item = &ChunkTag> {
        self.chunks.iter().map(|(t, _)| t)
    }

    /// Replace the first chunk with this tag, or append it.
    pub fn set_chunk(&mut self, tag: ChunkTag, data: Vec<u8>) {
        if let Some(slot) = self.chunks.iter_mut().find(|(t, _)| *t == tag) {
            slot.1 = data;
        } else {
            self.chunks.push((tag, data));
        }
    }

    pub fn unit_count(&self) -> Result<usize> {
        let headers = self.chunk(&TAG_UNITS).unwrap_or(&[]);
        if headers.len() % HEADER_SIZE != 0 {
            return Err(MapScriptError::Bounds(format!(
                "UNIT chunk length {} is not a multiple of {}",
                headers.len(),
                HEADER_SIZE
            )));
        }
        Ok(headers.len() / HEADER_SIZE)
    }

    /// Recompute every unit-derived chunk from scratch. Identical strings
    /// across units share one pool entry; code, variables and attributes are
    /// laid out contiguously in unit order.
    pub fn replace_units(&mut self, units: &[Unit]) -> Result<()> {
        let mut headers = Vec::with_capacity(units.len() * HEADER_SIZE);
        let mut code = Vec::new();
        let mut pool = Vec::new();
        let mut pool_offsets: HashMap<&str, u32> = HashMap::new();
        let mut string_offsets = Vec::new();
        let mut variables = Vec::new();
        let mut attributes = Vec::with_capacity(units.len() * ATTRIBUTE_COUNT);
        let mut storage_slots = 0usize;

        for unit in units {
            let mut header = unit.header.clone();

            header.string_index = to_u32(string_offsets.len() / 4, "string offset table")?;
            header.string_count = to_u32(unit.strings.len(), "string count")?;
            for s in &unit.strings {
                if s.as_bytes().contains(&0) {
                    return Err(MapScriptError::Bounds(format!(
                        "unit '{}' string {:?} contains a NUL byte",
                        header.name, s
                    )));
                }
                let off = match pool_offsets.get(s.as_str()) {
                    Some(off) => *off,
                    None => {
                        let off = to_u32(pool.len(), "string pool")?;
                        pool.extend_from_slice(s.as_bytes());
                        pool.push(0);
                        pool_offsets.insert(s.as_str(), off);
                        off
                    }
                };
                string_offsets.extend_from_slice(&off.to_be_bytes());
            }

            header.variable_offset = to_u32(variables.len(), "variable table")?;
            header.variable_count = to_u32(unit.variables.len(), "variable count")?;
            for v in &unit.variables {
                variables.extend_from_slice(&v.to_be_bytes());
            }

            header.script_data_offset = to_u32(code.len(), "code chunk")?;
            header.script_length = to_u32(unit.code.len(), "script length")?;
            code.extend_from_slice(&unit.code);

            header.attribute_offset = to_u32(attributes.len(), "attribute chunk")?;
            let mut attrs = unit.attributes.clone();
            attrs.resize(ATTRIBUTE_COUNT, 0);
            attributes.extend_from_slice(&attrs);

            storage_slots += header.instance_count as usize * unit.variables.len();
            headers.extend_from_slice(&header.to_bytes()?);
        }

        let derived = [
            headers,
            code,
            pool,
            string_offsets,
            variables,
            attributes,
            vec![0u8; storage_slots * 4],
        ];
        for (tag, data) in DERIVED_TAGS.into_iter().zip(derived) {
            self.set_chunk(tag, data);
        }
        Ok(())
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MapScriptError::Bounds(format!("{} exceeds the 32-bit format limit", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{decode_units, UnitHeader};

    fn chunk_bytes(tag: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn unit(name: &str, strings: &[&str], code: &[u8]) -> Unit {
        Unit {
            header: UnitHeader {
                name: name.to_string(),
                instance_count: 2,
                ..UnitHeader::default()
            },
            strings: strings.iter().map(|s| s.to_string()).collect(),
            variables: vec![1, 0, -3],
            code: code.to_vec(),
            attributes: vec![0; ATTRIBUTE_COUNT],
        }
    }

    #[test]
    fn preserves_unknown_chunks_and_trailer() {
        let mut raw = chunk_bytes(b"MISC", &[1, 2, 3]);
        raw.extend(chunk_bytes(b"CODE", &[0x0D]));
        raw.extend(chunk_bytes(b"END ", &[]));
        raw.extend_from_slice(b"tail");

        let container = MapContainer::parse(&raw).unwrap();
        assert_eq!(container.chunk(b"MISC"), Some(&[1u8, 2, 3][..]));
        assert_eq!(container.to_bytes().unwrap(), raw);
    }

    #[test]
    fn missing_terminator_is_accepted_and_written_back() {
        let raw = chunk_bytes(b"MISC", &[9]);
        let container = MapContainer::parse(&raw).unwrap();
        let mut expected = raw.clone();
        expected.extend(chunk_bytes(b"END ", &[]));
        assert_eq!(container.to_bytes().unwrap(), expected);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut raw = chunk_bytes(b"CODE", &[1, 2, 3, 4]);
        raw.truncate(raw.len() - 1);
        match MapContainer::parse(&raw) {
            Err(MapScriptError::TruncatedChunk { tag, offset }) => {
                assert_eq!(tag, "CODE");
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut raw = chunk_bytes(b"MISC", &[]);
        raw.extend_from_slice(b"CO");
        assert!(matches!(
            MapContainer::parse(&raw),
            Err(MapScriptError::TruncatedChunk { offset: 8, .. })
        ));
    }

    #[test]
    fn identical_strings_share_one_pool_slot() {
        let mut container = MapContainer::default();
        let units = vec![
            unit("A", &["Barrel", "EV_001"], &[0x0D]),
            unit("B", &["EV_001", "Crate"], &[0x0E, 0x0D]),
        ];
        container.replace_units(&units).unwrap();

        assert_eq!(container.chunk(&TAG_STRING_POOL).unwrap(), b"Barrel\0EV_001\0Crate\0");
        let offsets: Vec<u32> = container
            .chunk(&TAG_STRING_OFFSETS)
            .unwrap()
            .chunks(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(offsets, vec![0, 7, 7, 14]);
        assert_eq!(container.chunk(&TAG_STORAGE).unwrap().len(), 2 * (2 * 3 * 4));
    }

    #[test]
    fn rebuilt_units_are_contiguous_and_decode_back() {
        let mut container = MapContainer::default();
        let units = vec![
            unit("A", &["x"], &[0x0D]),
            unit("B", &[], &[0x0E, 0x0D]),
            unit("C", &["x", "y"], &[0x0D, 0x0D, 0x0D]),
        ];
        container.replace_units(&units).unwrap();

        let decoded = decode_units(&container).unwrap();
        let offsets: Vec<u32> = decoded.iter().map(|u| u.header.script_data_offset).collect();
        assert_eq!(offsets, vec![0, 1, 3]);
        for (d, u) in decoded.iter().zip(&units) {
            assert_eq!(d.strings, u.strings);
            assert_eq!(d.variables, u.variables);
            assert_eq!(d.code, u.code);
        }
    }

    #[test]
    fn write_then_read_matches() {
        let mut container = MapContainer::default();
        container.set_chunk(*b"MISC", vec![7, 7]);
        container.replace_units(&[unit("A", &["hello"], &[0x0D])]).unwrap();

        let path = std::env::temp_dir().join("mapscript_container_write.map");
        container.write(&path).unwrap();
        let back = MapContainer::read(&path).unwrap();
        assert_eq!(back, container);
        let _ = fs::remove_file(&path);
    }
}
