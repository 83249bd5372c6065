use crate::container::{
    MapContainer, TAG_ATTRIBUTES, TAG_CODE, TAG_STRING_OFFSETS, TAG_STRING_POOL, TAG_UNITS,
    TAG_VARIABLES,
};
use crate::{MapScriptError, Result};

pub const HEADER_SIZE: usize = 165;
pub const NAME_SIZE: usize = 128;
pub const ATTRIBUTE_COUNT: usize = 256;

// Field offsets inside one 165-byte header record.
const OFF_INSTANCES: usize = 128;
const OFF_STRING_COUNT: usize = 132;
const OFF_STRING_INDEX: usize = 136;
const OFF_VARIABLE_COUNT: usize = 140;
const OFF_VARIABLE_OFFSET: usize = 144;
const OFF_SCRIPT_LENGTH: usize = 148;
const OFF_SCRIPT_OFFSET: usize = 152;
const OFF_ENTRY_PC: usize = 156;
const OFF_ATTRIBUTE_OFFSET: usize = 160;
const OFF_KIND: usize = 164;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnitHeader {
    pub name: String,
    pub instance_count: u32,
    pub string_count: u32,
    /// First entry of this unit's window in the shared string offset table.
    pub string_index: u32,
    pub variable_count: u32,
    /// Byte offset of this unit's window in the shared variable chunk.
    pub variable_offset: u32,
    pub script_length: u32,
    pub script_data_offset: u32,
    pub entry_pc: u32,
    /// Byte offset of this unit's 256 attribute bytes.
    pub attribute_offset: u32,
    pub kind: u8,
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

impl UnitHeader {
    pub fn parse(record: &[u8]) -> Result<Self> {
        if record.len() != HEADER_SIZE {
            return Err(MapScriptError::Bounds(format!(
                "unit header record is {} bytes, expected {}",
                record.len(),
                HEADER_SIZE
            )));
        }

        let name_bytes = &record[..NAME_SIZE];
        let nul_pos = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..nul_pos]).into_owned();

        Ok(Self {
            name,
            instance_count: be_u32(record, OFF_INSTANCES),
            string_count: be_u32(record, OFF_STRING_COUNT),
            string_index: be_u32(record, OFF_STRING_INDEX),
            variable_count: be_u32(record, OFF_VARIABLE_COUNT),
            variable_offset: be_u32(record, OFF_VARIABLE_OFFSET),
            script_length: be_u32(record, OFF_SCRIPT_LENGTH),
            script_data_offset: be_u32(record, OFF_SCRIPT_OFFSET),
            entry_pc: be_u32(record, OFF_ENTRY_PC),
            attribute_offset: be_u32(record, OFF_ATTRIBUTE_OFFSET),
            kind: record[OFF_KIND],
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let name = self.name.as_bytes();
        // Keep room for at least one NUL terminator.
        if name.len() >= NAME_SIZE || name.contains(&0) {
            return Err(MapScriptError::Bounds(format!(
                "unit name '{}' does not fit the {}-byte name field",
                self.name, NAME_SIZE
            )));
        }

        let mut out = [0u8; HEADER_SIZE];
        out[..name.len()].copy_from_slice(name);
        let fields = [
            (OFF_INSTANCES, self.instance_count),
            (OFF_STRING_COUNT, self.string_count),
            (OFF_STRING_INDEX, self.string_index),
            (OFF_VARIABLE_COUNT, self.variable_count),
            (OFF_VARIABLE_OFFSET, self.variable_offset),
            (OFF_SCRIPT_LENGTH, self.script_length),
            (OFF_SCRIPT_OFFSET, self.script_data_offset),
            (OFF_ENTRY_PC, self.entry_pc),
            (OFF_ATTRIBUTE_OFFSET, self.attribute_offset),
        ];
        for (off, value) in fields {
            out[off..off + 4].copy_from_slice(&value.to_be_bytes());
        }
        out[OFF_KIND] = self.kind;
        Ok(out)
    }
}

/// One unit with its private windows resolved out of the shared chunks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Unit {
    pub header: UnitHeader,
    pub strings: Vec<String>,
    pub variables: Vec<i32>,
    pub code: Vec<u8>,
    pub attributes: Vec<u8>,
}

fn window<'a>(
    chunk: &'a [u8],
    start: usize,
    len: usize,
    what: &str,
    unit: &str,
) -> Result<&'a [u8]> {
    start
        .checked_add(len)
        .filter(|end| *end <= chunk.len())
        .map(|end| &chunk[start..end])
        .ok_or_else(|| {
            MapScriptError::Bounds(format!(
                "unit '{}': {} window {}..{} exceeds chunk length {}",
                unit,
                what,
                start,
                start.saturating_add(len),
                chunk.len()
            ))
        })
}

fn read_pool_string(pool: &[u8], offset: usize, unit: &str) -> Result<String> {
    let tail = pool.get(offset..).ok_or_else(|| {
        MapScriptError::Bounds(format!(
            "unit '{}': string offset {} exceeds pool length {}",
            unit,
            offset,
            pool.len()
        ))
    })?;
    let end = tail.iter().position(|&b| b == 0).ok_or_else(|| {
        MapScriptError::Bounds(format!(
            "unit '{}': string at offset {} is not NUL-terminated",
            unit, offset
        ))
    })?;
    Ok(String::from_utf8_lossy(&tail[..end]).into_owned())
}

/// Slice header `index` out of the header chunk and resolve its windows.
pub fn decode_unit(container: &MapContainer, index: usize) -> Result<Unit> {
    let headers = container.chunk(&TAG_UNITS).unwrap_or(&[]);
    let start = index * HEADER_SIZE;
    let record = window(headers, start, HEADER_SIZE, "header", &format!("#{}", index))?;
    let header = UnitHeader::parse(record)?;
    let name = header.name.as_str();

    let offsets = window(
        container.chunk(&TAG_STRING_OFFSETS).unwrap_or(&[]),
        header.string_index as usize * 4,
        header.string_count as usize * 4,
        "string table",
        name,
    )?;
    let pool = container.chunk(&TAG_STRING_POOL).unwrap_or(&[]);
    let mut strings = Vec::with_capacity(header.string_count as usize);
    for entry in offsets.chunks(4) {
        let off = be_u32(entry, 0) as usize;
        strings.push(read_pool_string(pool, off, name)?);
    }

    let vars = window(
        container.chunk(&TAG_VARIABLES).unwrap_or(&[]),
        header.variable_offset as usize,
        header.variable_count as usize * 4,
        "variable table",
        name,
    )?;
    let variables = vars
        .chunks(4)
        .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let code = window(
        container.chunk(&TAG_CODE).unwrap_or(&[]),
        header.script_data_offset as usize,
        header.script_length as usize,
        "bytecode",
        name,
    )?
    .to_vec();

    if header.entry_pc > header.script_length {
        return Err(MapScriptError::Bounds(format!(
            "unit '{}': entry pc {} is past script length {}",
            name, header.entry_pc, header.script_length
        )));
    }

    let attributes = window(
        container.chunk(&TAG_ATTRIBUTES).unwrap_or(&[]),
        header.attribute_offset as usize,
        ATTRIBUTE_COUNT,
        "attribute",
        name,
    )?
    .to_vec();

    Ok(Unit {
        header,
        strings,
        variables,
        code,
        attributes,
    })
}

/// Decode every unit. Any bounds failure or a gap/overlap between
/// consecutive bytecode windows rejects the whole container.
pub fn decode_units(container: &MapContainer) -> Result<Vec<Unit>> {
    let count = container.unit_count()?;
    let mut units = Vec::with_capacity(count);
    let mut expected_offset = 0u64;

    for index in 0..count {
        let unit = decode_unit(container, index)?;
        if unit.header.script_data_offset as u64 != expected_offset {
            return Err(MapScriptError::Bounds(format!(
                "unit {} '{}' starts its bytecode at {}, but the previous units end at {}",
                index, unit.header.name, unit.header.script_data_offset, expected_offset
            )));
        }
        expected_offset += unit.header.script_length as u64;
        units.push(unit);
    }

    Ok(units)
}
