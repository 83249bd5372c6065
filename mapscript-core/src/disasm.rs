use std::collections::BTreeSet;

use crate::header::Unit;
use crate::opcode::*;
use crate::params::ArgumentKind;
use crate::symbols::{SymbolCatalog, SymbolTable};
use crate::{MapScriptError, Result};

const INDENT: &str = "    ";

/// One decoded statement of a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Byte address inside the unit's own bytecode.
    pub address: u32,
    /// Brace-nesting depth; top-level statements sit at 1.
    pub indent: usize,
    pub text: String,
    pub comment: Option<String>,
    /// Some goto/end/gosub/pause operand (or the entry point) targets this address.
    pub is_label: bool,
}

/// Enclosing routine and argument position of a call parameter.
#[derive(Copy, Clone)]
struct ParamSlot<'a> {
    routine: &'a str,
    index: usize,
}

pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

struct Disassembler<'a> {
    catalog: &'a SymbolCatalog,
    unit: &'a Unit,
    code: &'a [u8],
    pos: usize,
    labels: BTreeSet<u32>,
    instructions: Vec<Instruction>,
    comments: Vec<String>,
}

impl<'a> Disassembler<'a> {
    fn new(catalog: &'a SymbolCatalog, unit: &'a Unit) -> Self {
        Self {
            catalog,
            unit,
            code: &unit.code,
            pos: 0,
            labels: BTreeSet::new(),
            instructions: Vec::new(),
            comments: Vec::new(),
        }
    }

    fn unit_name(&self) -> &str {
        &self.unit.header.name
    }

    fn truncated(&self, want: usize) -> MapScriptError {
        MapScriptError::Bounds(format!(
            "unit '{}': operand of {} bytes at offset {} runs past script length {}",
            self.unit_name(),
            want,
            self.pos,
            self.code.len()
        ))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let code = self.code;
        let end = self.pos + n;
        if end > code.len() {
            return Err(self.truncated(n));
        }
        let bytes = &code[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    fn peek(&self) -> Option<u8> {
        self.code.get(self.pos).copied()
    }

    fn unknown_opcode(&self, offset: usize, opcode: u8) -> MapScriptError {
        MapScriptError::UnknownOpcode {
            unit: self.unit_name().to_string(),
            offset,
            opcode,
        }
    }

    fn label_operand(&mut self) -> Result<u32> {
        let target = self.read_u32()?;
        self.labels.insert(target);
        Ok(target)
    }

    fn push(&mut self, address: usize, indent: usize, text: String) {
        let comment = if self.comments.is_empty() {
            None
        } else {
            Some(self.comments.drain(..).collect::<Vec<_>>().join(" | "))
        };
        self.instructions.push(Instruction {
            address: address as u32,
            indent,
            text,
            comment,
            is_label: false,
        });
    }

    fn decode_block(&mut self, end: usize, indent: usize) -> Result<()> {
        while self.pos < end {
            self.decode_statement(indent)?;
        }
        if self.pos != end {
            return Err(MapScriptError::Bounds(format!(
                "unit '{}': statement crosses the block end at offset {}",
                self.unit_name(),
                end
            )));
        }
        Ok(())
    }

    fn nested_block(&mut self, indent: usize) -> Result<()> {
        let len = self.read_u32()? as usize;
        let end = self.pos + len;
        if end > self.code.len() {
            return Err(MapScriptError::Bounds(format!(
                "unit '{}': block of {} bytes at offset {} runs past script length {}",
                self.unit_name(),
                len,
                self.pos,
                self.code.len()
            )));
        }
        self.decode_block(end, indent + 1)
    }

    fn decode_statement(&mut self, indent: usize) -> Result<()> {
        let start = self.pos;
        let op = self.read_u8()?;

        match op {
            OP_TASK_CALL | OP_ASYNC_CALL | OP_FUNCTION_CALL => {
                let text = self.decode_call(op, true)?;
                self.push(start, indent, text);
            }
            OP_OBJECT_CALL => {
                let text = self.decode_object_call(true)?;
                self.push(start, indent, text);
            }
            OP_IF => {
                let cond = self.decode_conditions()?;
                self.push(start, indent, format!("if {}", cond));
                self.nested_block(indent)?;
            }
            OP_RESULT_BRANCH => {
                let value = self.read_u8()?;
                self.push(start, indent, format!("if <{}> = {}", SCRIPT_RV, value));
                self.nested_block(indent)?;
            }
            OP_GOTO | OP_END => {
                let keyword = if op == OP_GOTO { "goto" } else { "end" };
                let target = self.read_u32()?;
                let text = if target == 0 {
                    keyword.to_string()
                } else {
                    self.labels.insert(target);
                    format!("{} #{}", keyword, target)
                };
                self.push(start, indent, text);
            }
            OP_GOSUB => {
                let target = self.label_operand()?;
                self.push(start, indent, format!("gosub #{}", target));
            }
            OP_TASK_PAUSE => {
                let target = self.label_operand()?;
                self.push(start, indent, format!("@pause #{}", target));
            }
            OP_ANCHOR => {
                let value = self.read_u8()?;
                self.push(start, indent, format!("@anchor {}", value));
            }
            OP_RETURN => self.push(start, indent, "return".to_string()),
            OP_ENDINT => self.push(start, indent, "endint".to_string()),
            OP_FLAG | OP_VARIABLE | OP_OBJECT_FIELD => {
                self.pos = start;
                let text = self.decode_value(ValueMode::Main, None)?;
                self.push(start, indent, text);
            }
            other => return Err(self.unknown_opcode(start, other)),
        }

        Ok(())
    }

    fn routine_name(&self, ordinal: u16) -> (String, Option<&'a str>) {
        let catalog = self.catalog;
        match catalog.lookup_by_ordinal(SymbolTable::Routines, ordinal as usize) {
            Some(name) => (name.to_string(), Some(name)),
            None => (format!("routine{}", ordinal), None),
        }
    }

    /// Everything after a call opcode: routine, count and arguments.
    fn decode_call(&mut self, op: u8, statement: bool) -> Result<String> {
        let ordinal = self.read_u16()?;
        let (name, known) = self.routine_name(ordinal);

        let mut args = Vec::new();
        if ordinal != 0 {
            let count = self.read_u8()? as usize;
            if let Some(routine) = self.catalog.routine(ordinal as usize) {
                if routine.param_count as usize != count {
                    log::debug!(
                        "unit '{}': {} declared with {} parameters, called with {}",
                        self.unit_name(),
                        name,
                        routine.param_count,
                        count
                    );
                }
            }
            for index in 0..count {
                let slot = known.map(|routine| ParamSlot { routine, index });
                args.push(self.decode_value(ValueMode::CallParameter, slot)?);
            }
        }

        let prefix = match op {
            OP_ASYNC_CALL => "async ",
            OP_FUNCTION_CALL if statement => "call ",
            _ => "",
        };
        Ok(format!("{}{}({})", prefix, name, args.join(", ")))
    }

    fn decode_object_call(&mut self, statement: bool) -> Result<String> {
        let object = self.decode_object_name()?;
        let call_at = self.pos;
        let op = self.read_u8()?;
        if !matches!(op, OP_TASK_CALL | OP_ASYNC_CALL | OP_FUNCTION_CALL) {
            return Err(self.unknown_opcode(call_at, op));
        }
        let call = self.decode_call(op, statement)?;
        // Keep the async/call keyword in front of the object.
        Ok(match call.split_once(' ') {
            Some((keyword, rest)) if keyword == "async" || keyword == "call" => {
                format!("{} {}.{}", keyword, object, rest)
            }
            _ => format!("{}.{}", object, call),
        })
    }

    fn decode_object_name(&mut self) -> Result<String> {
        let at = self.pos;
        match self.read_u8()? {
            OBJECT_BUILTIN => {
                let code = self.read_u8()?;
                self.take(1)?;
                BUILTIN_OBJECTS
                    .get(code as usize)
                    .map(|s| s.to_string())
                    .ok_or_else(|| self.unknown_opcode(at + 1, code))
            }
            OBJECT_CUSTOM => {
                let index = self.read_u32()?;
                Ok(quote(self.string(index)?))
            }
            OBJECT_DYNAMIC => self.decode_value(ValueMode::Reference, None),
            other => Err(self.unknown_opcode(at, other)),
        }
    }

    fn string(&self, index: u32) -> Result<&'a str> {
        let unit = self.unit;
        unit.strings
            .get(index as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| {
                MapScriptError::Bounds(format!(
                    "unit '{}': string index {} outside its table of {}",
                    unit.header.name,
                    index,
                    unit.strings.len()
                ))
            })
    }

    fn decode_conditions(&mut self) -> Result<String> {
        let mut text = String::new();
        loop {
            let left = self.decode_value(ValueMode::LeftOperand, None)?;
            let cmp_at = self.pos;
            let cmp = self.read_u8()?;
            let cmp_text = comparator_text(cmp).ok_or_else(|| self.unknown_opcode(cmp_at, cmp))?;
            let right = self.decode_value(ValueMode::RightOperand, None)?;
            text.push_str(&format!("{} {} {}", left, cmp_text, right));

            let conj_at = self.pos;
            match self.read_u8()? {
                CONJUNCTION_END => break,
                CONJUNCTION_AND => text.push_str(" and "),
                CONJUNCTION_OR => text.push_str(" or "),
                other => return Err(self.unknown_opcode(conj_at, other)),
            }
        }
        Ok(text)
    }

    fn decode_value(&mut self, mode: ValueMode, slot: Option<ParamSlot<'a>>) -> Result<String> {
        let mut text = self.decode_operand(mode, slot)?;
        if mode.takes_operators() {
            while let Some(op) = self.peek().and_then(operator_text) {
                self.pos += 1;
                let rhs = self.decode_operand(mode, slot)?;
                text = format!("{} {} {}", text, op, rhs);
            }
        }
        Ok(text)
    }

    fn decode_operand(&mut self, mode: ValueMode, slot: Option<ParamSlot<'a>>) -> Result<String> {
        let start = self.pos;
        let op = self.read_u8()?;

        match op {
            OP_FLAG => {
                let ordinal = self.read_u16()?;
                let name = self
                    .catalog
                    .lookup_by_ordinal(SymbolTable::Flags, ordinal as usize)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("flag{}", ordinal));
                self.continue_target(name, mode, 2)
            }
            OP_VARIABLE => {
                let slot_index = self.read_u8()?;
                self.continue_target(format!("var{}", slot_index), mode, 3)
            }
            OP_OBJECT_FIELD => {
                let object = self.decode_object_name()?;
                // The high byte of the reference word is not part of the ordinal.
                let reference = self.read_u16()? & 0x00FF;
                let name = self
                    .catalog
                    .lookup_by_ordinal(SymbolTable::References, reference as usize)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("ref{}", reference));
                self.continue_target(format!("{}.{}", object, name), mode, 0)
            }
            _ if mode == ValueMode::Main => Err(self.unknown_opcode(start, op)),
            OP_LITERAL => Ok(self.read_i32()?.to_string()),
            OP_FLEXIBLE => {
                let value = self.read_i32()?;
                self.render_flexible(value, slot)
            }
            OP_STRING => {
                let index = self.read_u32()?;
                Ok(quote(self.string(index)?))
            }
            OP_FUNCTION_CALL => self.decode_call(op, false),
            OP_OBJECT_CALL => self.decode_object_call(false),
            other => Err(self.unknown_opcode(start, other)),
        }
    }

    /// Follow-on bytes of an assignable value (flag, variable, field).
    fn continue_target(&mut self, name: String, mode: ValueMode, padding: usize) -> Result<String> {
        match mode {
            ValueMode::Main => {
                let formula = self.decode_value(ValueMode::Formula, None)?;
                Ok(format!("{} = {}", name, formula))
            }
            ValueMode::CallParameter => {
                self.take(padding)?;
                Ok(name)
            }
            _ => Ok(name),
        }
    }

    fn render_flexible(&mut self, value: i32, slot: Option<ParamSlot<'a>>) -> Result<String> {
        let catalog = self.catalog;
        let unit = self.unit;
        let kind = slot.and_then(|s| catalog.argument_kind(s.routine, s.index));
        let rendered = match kind {
            Some(ArgumentKind::Dialogue) => {
                let label = usize::try_from(value).ok().and_then(|i| unit.strings.get(i));
                label.map(|label| {
                    if let Some(text) = catalog.dialogue_text(label) {
                        self.comments.push(text.to_string());
                    }
                    quote(label)
                })
            }
            Some(ArgumentKind::Item) => self.bracketed(SymbolTable::Items, value),
            Some(ArgumentKind::Map) => self.bracketed(SymbolTable::MapTargets, value),
            None => None,
        };
        Ok(rendered.unwrap_or_else(|| value.to_string()))
    }

    fn bracketed(&self, table: SymbolTable, value: i32) -> Option<String> {
        let index = usize::try_from(value).ok()?;
        self.catalog
            .lookup_by_ordinal(table, index)
            .map(|name| format!("<{}>", name))
    }

    fn finish(mut self) -> Result<(Vec<Instruction>, Vec<u32>)> {
        self.decode_block(self.code.len(), 1)?;

        let entry = self.unit.header.entry_pc;
        if entry != 0 {
            self.labels.insert(entry);
        }

        let mut trailing = Vec::new();
        for &label in &self.labels {
            if let Some(ins) = self.instructions.iter_mut().find(|i| i.address == label) {
                ins.is_label = true;
            } else if label as usize == self.code.len() {
                trailing.push(label);
            } else {
                return Err(MapScriptError::Bounds(format!(
                    "unit '{}': label #{} does not land on an instruction",
                    self.unit.header.name, label
                )));
            }
        }

        Ok((self.instructions, trailing))
    }
}

/// Decode one unit's bytecode into addressed, indented instructions.
pub fn disassemble_unit(catalog: &SymbolCatalog, unit: &Unit) -> Result<Vec<Instruction>> {
    Ok(Disassembler::new(catalog, unit).finish()?.0)
}

fn indent(level: usize) -> String {
    INDENT.repeat(level)
}

fn unit_preamble(catalog: &SymbolCatalog, unit: &Unit) -> Vec<String> {
    let header = &unit.header;
    let mut lines = vec![
        format!("unit {}", quote(&header.name)),
        format!("instances = {}", header.instance_count),
    ];
    if header.kind != 0 {
        lines.push(format!("kind = {}", header.kind));
    }
    if header.entry_pc != 0 {
        lines.push(format!("entry = #{}", header.entry_pc));
    } else {
        lines.push("entry = 0".to_string());
    }
    if !unit.strings.is_empty() {
        let quoted: Vec<String> = unit.strings.iter().map(|s| quote(s)).collect();
        lines.push(format!("strings = {}", quoted.join(", ")));
    }

    let used = unit
        .variables
        .iter()
        .rposition(|v| *v != 0)
        .map_or(0, |i| i + 1);
    if used == 0 {
        lines.push(format!("variables({})", unit.variables.len()));
    } else {
        let values: Vec<String> = unit.variables[..used].iter().map(|v| v.to_string()).collect();
        lines.push(format!(
            "variables({}) = {}",
            unit.variables.len(),
            values.join(", ")
        ));
    }

    for (index, value) in unit.attributes.iter().enumerate() {
        if *value == 0 {
            continue;
        }
        let name = catalog
            .lookup_by_ordinal(SymbolTable::Attributes, index)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("attr{}", index));
        lines.push(format!("{} = {}", name, value));
    }

    lines
}

/// Full text of one unit: preamble, attribute lines and the braced body.
pub fn disassemble_unit_text(catalog: &SymbolCatalog, unit: &Unit) -> Result<Vec<String>> {
    let (instructions, trailing) = Disassembler::new(catalog, unit).finish()?;
    let mut lines = unit_preamble(catalog, unit);

    let mut level = 0usize;
    for ins in &instructions {
        while level < ins.indent {
            lines.push(format!("{}{{", indent(level)));
            level += 1;
        }
        while level > ins.indent {
            level -= 1;
            lines.push(format!("{}}}", indent(level)));
        }
        if ins.is_label {
            lines.push(format!("{}#{}:", indent(level), ins.address));
        }
        match &ins.comment {
            Some(comment) => lines.push(format!("{}{} // {}", indent(level), ins.text, comment)),
            None => lines.push(format!("{}{}", indent(level), ins.text)),
        }
    }

    if level == 0 {
        lines.push("{".to_string());
        level = 1;
    }
    while level > 1 {
        level -= 1;
        lines.push(format!("{}}}", indent(level)));
    }
    for label in trailing {
        lines.push(format!("{}#{}:", indent(1), label));
    }
    lines.push("}".to_string());

    Ok(lines)
}

/// Text of every unit of a map, separated by blank lines. Patch line
/// positions refer to this listing.
pub fn disassemble_units(catalog: &SymbolCatalog, units: &[Unit]) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        lines.extend(disassemble_unit_text(catalog, unit)?);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{UnitHeader, ATTRIBUTE_COUNT};
    use crate::symbols::tests::sample_catalog;

    fn unit_with(code: Vec<u8>, strings: &[&str]) -> Unit {
        Unit {
            header: UnitHeader {
                name: "Keeper".to_string(),
                instance_count: 1,
                script_length: code.len() as u32,
                ..UnitHeader::default()
            },
            strings: strings.iter().map(|s| s.to_string()).collect(),
            variables: vec![0, 5, 0, 0],
            code,
            attributes: vec![0; ATTRIBUTE_COUNT],
        }
    }

    #[test]
    fn decodes_assignment_and_if_block() {
        let cat = sample_catalog();
        let code = vec![
            6, 0, 0, 7, 0, 0, 0, 1, // Door1 = 1
            3, 6, 0, 1, 0, 7, 0, 0, 0, 1, 1, 6, 0, 0, 0, 7, 0, 0, 0, 1, 0, // if ...
            0, 0, 0, 4, // block length
            0, 0, 1, 0, // OpenDoor()
        ];
        let ins = disassemble_unit(&cat, &unit_with(code, &[])).unwrap();
        let texts: Vec<(&str, usize)> = ins.iter().map(|i| (i.text.as_str(), i.indent)).collect();
        assert_eq!(
            texts,
            vec![
                ("Door1 = 1", 1),
                ("if Lit = 1 and Door1 = 1", 1),
                ("OpenDoor()", 2),
            ]
        );
        assert_eq!(ins[2].address, 33);
    }

    #[test]
    fn renders_braces_labels_and_preamble() {
        let cat = sample_catalog();
        let code = vec![
            0x0D, // return
            0x04, 0, 0, 0, 0, // goto #0 -> no target
            0x04, 0, 0, 0, 1, // goto #1
        ];
        let mut unit = unit_with(code, &["Barrel"]);
        unit.attributes[0] = 1;
        unit.attributes[9] = 4;
        let text = disassemble_unit_text(&cat, &unit).unwrap();
        assert_eq!(
            text,
            vec![
                "unit \"Keeper\"",
                "instances = 1",
                "entry = 0",
                "strings = \"Barrel\"",
                "variables(4) = 0, 5",
                "Solid = 1",
                "attr9 = 4",
                "{",
                "    return",
                "    #1:",
                "    goto",
                "    goto #1",
                "}",
            ]
        );
    }

    #[test]
    fn flexible_arguments_follow_the_argument_table() {
        let cat = sample_catalog();
        let code = vec![
            0, 0, 2, 1, 8, 0, 0, 0, 0, // Message("EV_001")
            0, 0, 3, 2, 8, 0, 0, 0, 1, 7, 0, 0, 0, 2, // GiveItem(<Ether>, 2)
            0, 0, 4, 2, 8, 0, 0, 0, 1, 8, 0, 0, 0, 9, // Warp(<CASTLE>, 9)
        ];
        let ins = disassemble_unit(&cat, &unit_with(code, &["EV_001"])).unwrap();
        assert_eq!(ins[0].text, "Message(\"EV_001\")");
        assert_eq!(ins[0].comment.as_deref(), Some("Welcome, traveller."));
        assert_eq!(ins[1].text, "GiveItem(<Ether>, 2)");
        assert_eq!(ins[2].text, "Warp(<CASTLE>, 9)");
    }

    #[test]
    fn call_parameters_skip_padding() {
        let cat = sample_catalog();
        let code = vec![
            0, 0, 7, 2, 6, 0, 1, 0xAA, 0xBB, 9, 3, 0, 0, 0, // Wait(Lit, var3)
        ];
        let ins = disassemble_unit(&cat, &unit_with(code, &[])).unwrap();
        assert_eq!(ins[0].text, "Wait(Lit, var3)");
    }

    #[test]
    fn objects_operators_and_markers() {
        let cat = sample_catalog();
        let code = vec![
            0x0B, 0, 0, 0, 0, 0, // self.Health
            0x0B, 0, 0, 0, 0, 0, 0x20, 7, 0, 0, 0, 1, // = self.Health + 1
            0x0C, 1, 0, 0, 0, 0, 1, 0, 6, 1, 9, 2, 0, 0, 0, // async "Barrel".Roll(var2)
            0x10, 3, // @anchor 3
            0x12, 2, 0, 0, 0, 1, 0x0E, // if <ScriptRv> = 2 { endint }
            0x11, 0, 0, 0, 0, // @pause #0
        ];
        let ins = disassemble_unit(&cat, &unit_with(code, &["Barrel"])).unwrap();
        let texts: Vec<&str> = ins.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "self.Health = self.Health + 1",
                "async \"Barrel\".Roll(var2)",
                "@anchor 3",
                "if <ScriptRv> = 2",
                "endint",
                "@pause #0",
            ]
        );
        assert!(ins[0].is_label);
    }

    #[test]
    fn unknown_opcode_is_reported_with_offset() {
        let cat = sample_catalog();
        let err = disassemble_unit(&cat, &unit_with(vec![0x0D, 0x7F], &[])).unwrap_err();
        match err {
            MapScriptError::UnknownOpcode { offset, opcode, .. } => {
                assert_eq!(offset, 1);
                assert_eq!(opcode, 0x7F);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn misaligned_label_is_rejected() {
        let cat = sample_catalog();
        let code = vec![0x04, 0, 0, 0, 2, 0x0D];
        assert!(matches!(
            disassemble_unit(&cat, &unit_with(code, &[])),
            Err(MapScriptError::Bounds(_))
        ));
    }

    #[test]
    fn label_at_script_end_is_kept() {
        let cat = sample_catalog();
        let code = vec![0x0F, 0, 0, 0, 5];
        let text = disassemble_unit_text(&cat, &unit_with(code, &[])).unwrap();
        assert_eq!(&text[text.len() - 4..], &["{", "    gosub #5", "    #5:", "}"]);
    }

    #[test]
    fn block_past_script_end_is_rejected() {
        let cat = sample_catalog();
        let code = vec![0x12, 1, 0, 0, 0, 9, 0x0D];
        assert!(matches!(
            disassemble_unit(&cat, &unit_with(code, &[])),
            Err(MapScriptError::Bounds(_))
        ));
    }
}
