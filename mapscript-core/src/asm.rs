use std::collections::BTreeMap;

use crate::header::{Unit, UnitHeader, ATTRIBUTE_COUNT};
use crate::opcode::*;
use crate::params::ArgumentKind;
use crate::symbols::{SymbolCatalog, SymbolTable};
use crate::{MapScriptError, Result};

// ---------------------------------------------------------------------------
// Pre-pass
// ---------------------------------------------------------------------------

/// Strip a trailing `//` comment and collapse `, ` runs, leaving quoted text
/// untouched.
fn strip_comment(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => break,
            ',' => {
                out.push(',');
                while chars.peek() == Some(&' ') {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }

    out.trim().to_string()
}

/// Byte offset of the first `pat` outside quotes.
fn find_outside_quotes(line: &str, pat: &str) -> Option<usize> {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'\\' {
                i += 1;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if bytes[i..].starts_with(pat.as_bytes()) {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// `x++`, `x--`, `x += e` and `x -= e` become plain assignments.
fn expand_compound(line: String) -> String {
    for (pat, op) in [("+=", "+"), ("-=", "-")] {
        if let Some(at) = find_outside_quotes(&line, pat) {
            let target = line[..at].trim();
            let rhs = line[at + pat.len()..].trim();
            return format!("{} = {} {} {}", target, target, op, rhs);
        }
    }
    for (suffix, op) in [("++", "+"), ("--", "-")] {
        if let Some(target) = line.strip_suffix(suffix) {
            let target = target.trim();
            return format!("{} = {} {} 1", target, target, op);
        }
    }
    line
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace `<Name>` tokens by their map ordinal, else their item ordinal.
fn substitute_brackets(
    catalog: &SymbolCatalog,
    line: &str,
    map: &str,
    line_no: usize,
) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    let mut rest = line;

    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            rest = &rest[c.len_utf8()..];
            if c == '\\' {
                if let Some(escaped) = rest.chars().next() {
                    out.push(escaped);
                    rest = &rest[escaped.len_utf8()..];
                }
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        if c == '<' {
            let body = &rest[1..];
            let name_len = body
                .char_indices()
                .find(|(_, ch)| !is_ident_char(*ch))
                .map_or(body.len(), |(i, _)| i);
            let name = &body[..name_len];
            let closed = body[name_len..].starts_with('>');
            if closed && name.chars().next().is_some_and(is_ident_start) {
                if name == SCRIPT_RV {
                    out.push_str(&rest[..name_len + 2]);
                } else {
                    let ordinal = catalog
                        .lookup_ordinal(SymbolTable::MapTargets, name)
                        .or_else(|| catalog.lookup_ordinal(SymbolTable::Items, name))
                        .ok_or_else(|| MapScriptError::UnknownSymbol {
                            map: map.to_string(),
                            line: line_no,
                            name: format!("<{}>", name),
                        })?;
                    out.push_str(&ordinal.to_string());
                }
                rest = &rest[name_len + 2..];
                continue;
            }
        }

        if c == '"' {
            in_string = true;
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    Ok(out)
}

/// Run the per-line pre-pass over a map's text. Empty lines are dropped;
/// the remaining lines keep their 1-based position.
fn prepare_lines(catalog: &SymbolCatalog, lines: &[String], map: &str) -> Result<Vec<(usize, String)>> {
    let mut prepared = Vec::new();
    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }
        let line = expand_compound(line);
        let line = substitute_brackets(catalog, &line, map, line_no)?;
        prepared.push((line_no, line));
    }
    Ok(prepared)
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Label(u32),
    ScriptRv,
    Sym(&'static str),
}

const SYMBOLS: [&str; 19] = [
    "!=", "<=", ">=", "=", "<", ">", "+", "-", "*", "/", "%", "(", ")", ",", ".", ":", "@",
    "{", "}",
];

fn tokenize(line: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = line;
    let script_rv = format!("<{}>", SCRIPT_RV);

    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c == '"' {
            let mut text = String::new();
            let mut chars = rest[1..].char_indices();
            let mut end = None;
            while let Some((i, ch)) = chars.next() {
                match ch {
                    '"' => {
                        end = Some(i + 2);
                        break;
                    }
                    '\\' => match chars.next() {
                        Some((_, 'n')) => text.push('\n'),
                        Some((_, other)) => text.push(other),
                        None => return Err("unterminated escape".to_string()),
                    },
                    _ => text.push(ch),
                }
            }
            let end = end.ok_or_else(|| "unterminated string".to_string())?;
            tokens.push(Token::Str(text));
            rest = &rest[end..];
            continue;
        }

        if c == '#' {
            let digits: String = rest[1..].chars().take_while(|d| d.is_ascii_digit()).collect();
            let label = digits
                .parse::<u32>()
                .map_err(|_| format!("bad label '{}'", rest))?;
            tokens.push(Token::Label(label));
            rest = &rest[1 + digits.len()..];
            continue;
        }

        if c.is_ascii_digit() {
            let digits: String = rest.chars().take_while(|d| d.is_ascii_digit()).collect();
            let value = digits
                .parse::<i64>()
                .map_err(|_| format!("integer '{}' out of range", digits))?;
            tokens.push(Token::Int(value));
            rest = &rest[digits.len()..];
            continue;
        }

        if is_ident_start(c) {
            let ident: String = rest.chars().take_while(|ch| is_ident_char(*ch)).collect();
            rest = &rest[ident.len()..];
            tokens.push(Token::Ident(ident));
            continue;
        }

        if rest.starts_with(&script_rv) {
            tokens.push(Token::ScriptRv);
            rest = &rest[script_rv.len()..];
            continue;
        }

        match SYMBOLS.iter().find(|s| rest.starts_with(**s)) {
            Some(sym) => {
                tokens.push(Token::Sym(*sym));
                rest = &rest[sym.len()..];
            }
            None => return Err(format!("unexpected character '{}'", c)),
        }
    }

    Ok(tokens)
}

struct Cursor<'t> {
    tokens: &'t [Token],
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl<'t> Cursor<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'t Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek_sym(&self, sym: &str) -> bool {
        matches!(self.peek(), Some(Token::Sym(s)) if *s == sym)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if self.peek_sym(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: &str) -> ParseResult<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(format!("expected '{}'", sym))
        }
    }

    fn expect_end(&self) -> ParseResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected {:?} after statement", token)),
        }
    }

    fn expect_label(&mut self) -> ParseResult<u32> {
        match self.next() {
            Some(Token::Label(label)) => Ok(*label),
            _ => Err("expected a label '#N'".to_string()),
        }
    }

    fn signed_int(&mut self) -> ParseResult<i64> {
        let negative = self.eat_sym("-");
        match self.next() {
            Some(Token::Int(v)) if negative => Ok(-*v),
            Some(Token::Int(v)) => Ok(*v),
            _ => Err("expected an integer".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
enum Object {
    Builtin(u8),
    Custom(String),
    Dynamic(Box<Operand>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Call {
    name: String,
    args: Vec<Expr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Operand {
    Int(i64),
    Str(String),
    /// Flag name.
    Name(String),
    Var(u8),
    Field(Object, String),
    Call(Call),
    ObjectCall(Object, Call),
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Expr {
    head: Operand,
    tail: Vec<(u8, Operand)>,
}

fn parse_expr(cur: &mut Cursor) -> ParseResult<Expr> {
    let head = parse_operand(cur)?;
    let mut tail = Vec::new();
    while let Some(Token::Sym(sym)) = cur.peek() {
        let Some(code) = operator_code(sym) else {
            break;
        };
        cur.next();
        tail.push((code, parse_operand(cur)?));
    }
    Ok(Expr { head, tail })
}

fn parse_operand(cur: &mut Cursor) -> ParseResult<Operand> {
    match cur.next() {
        Some(Token::Int(v)) => Ok(Operand::Int(*v)),
        Some(Token::Sym("-")) => match cur.next() {
            Some(Token::Int(v)) => Ok(Operand::Int(-*v)),
            _ => Err("expected an integer after '-'".to_string()),
        },
        Some(Token::Str(s)) => {
            if cur.eat_sym(".") {
                parse_member(cur, Object::Custom(s.clone()))
            } else {
                Ok(Operand::Str(s.clone()))
            }
        }
        Some(Token::Ident(name)) => {
            if cur.peek_sym("(") {
                return Ok(Operand::Call(parse_call_args(cur, name)?));
            }
            let plain = match variable_slot(name) {
                Some(slot) => Operand::Var(slot),
                None => Operand::Name(name.clone()),
            };
            if cur.eat_sym(".") {
                let object = match builtin_object_code(name) {
                    Some(code) => Object::Builtin(code),
                    None => Object::Dynamic(Box::new(plain)),
                };
                return parse_member(cur, object);
            }
            Ok(plain)
        }
        Some(token) => Err(format!("unexpected {:?} where a value was expected", token)),
        None => Err("missing value".to_string()),
    }
}

fn parse_member(cur: &mut Cursor, object: Object) -> ParseResult<Operand> {
    match cur.next() {
        Some(Token::Ident(member)) => {
            if cur.peek_sym("(") {
                Ok(Operand::ObjectCall(object, parse_call_args(cur, member)?))
            } else {
                Ok(Operand::Field(object, member.clone()))
            }
        }
        _ => Err("expected a member name after '.'".to_string()),
    }
}

fn parse_call_args(cur: &mut Cursor, name: &str) -> ParseResult<Call> {
    cur.expect_sym("(")?;
    let mut args = Vec::new();
    if !cur.eat_sym(")") {
        loop {
            args.push(parse_expr(cur)?);
            if cur.eat_sym(")") {
                break;
            }
            cur.expect_sym(",")?;
        }
    }
    Ok(Call {
        name: name.to_string(),
        args,
    })
}

/// `prefixN` fallback names for ordinals missing from the catalog.
fn fallback_ordinal(name: &str, prefix: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Unit encoding
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LabelEntry {
    resolved: Option<u32>,
    /// Byte positions of reserved label slots in the unit's code.
    pending: Vec<usize>,
}

struct LineSource {
    lines: Vec<(usize, String)>,
    pos: usize,
}

impl LineSource {
    fn next(&mut self) -> Option<(usize, String)> {
        let line = self.lines.get(self.pos).cloned();
        if line.is_some() {
            self.pos += 1;
        }
        line
    }

    fn peek_text(&self) -> Option<&str> {
        self.lines.get(self.pos).map(|(_, text)| text.as_str())
    }
}

struct UnitAssembler<'a> {
    catalog: &'a SymbolCatalog,
    map: &'a str,
    line: usize,
    name: String,
    code: Vec<u8>,
    strings: Vec<String>,
    labels: BTreeMap<u32, LabelEntry>,
}

impl<'a> UnitAssembler<'a> {
    fn new(catalog: &'a SymbolCatalog, map: &'a str, name: String, line: usize) -> Self {
        Self {
            catalog,
            map,
            line,
            name,
            code: Vec::new(),
            strings: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    fn syntax(&self, message: impl Into<String>) -> MapScriptError {
        MapScriptError::Syntax {
            map: self.map.to_string(),
            line: self.line,
            message: message.into(),
        }
    }

    fn unknown(&self, name: &str) -> MapScriptError {
        MapScriptError::UnknownSymbol {
            map: self.map.to_string(),
            line: self.line,
            name: name.to_string(),
        }
    }

    fn tokens(&self, text: &str) -> Result<Vec<Token>> {
        tokenize(text).map_err(|msg| self.syntax(msg))
    }

    fn intern(&mut self, s: &str) -> usize {
        match self.strings.iter().position(|existing| existing == s) {
            Some(index) => index,
            None => {
                self.strings.push(s.to_string());
                self.strings.len() - 1
            }
        }
    }

    fn resolve(&self, table: SymbolTable, name: &str, fallback: &str, max: usize) -> Result<usize> {
        let ordinal = self
            .catalog
            .lookup_ordinal(table, name)
            .or_else(|| fallback_ordinal(name, fallback))
            .ok_or_else(|| self.unknown(name))?;
        if ordinal > max {
            return Err(self.syntax(format!("ordinal {} of '{}' exceeds {}", ordinal, name, max)));
        }
        Ok(ordinal)
    }

    fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_be_bytes());
    }

    fn emit_i32(&mut self, value: i64) -> Result<()> {
        let value = i32::try_from(value)
            .map_err(|_| self.syntax(format!("{} does not fit a 32-bit integer", value)))?;
        self.code.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn small(&self, value: i64, what: &str) -> Result<u8> {
        u8::try_from(value).map_err(|_| self.syntax(format!("{} {} is out of range 0-255", what, value)))
    }

    fn use_label(&mut self, label: u32) {
        let slot = self.code.len();
        self.code.extend_from_slice(&[0u8; LABEL_SLOT_WIDTH]);
        self.labels.entry(label).or_default().pending.push(slot);
    }

    fn define_label(&mut self, label: u32) -> Result<()> {
        let here = self.code.len() as u32;
        if self.labels.get(&label).is_some_and(|entry| entry.resolved.is_some()) {
            return Err(self.syntax(format!("label #{} defined twice", label)));
        }
        self.labels.entry(label).or_default().resolved = Some(here);
        Ok(())
    }

    /// Write every resolved address into the low two bytes of its slots.
    fn patch_labels(&mut self) -> Result<()> {
        for (label, entry) in &self.labels {
            let Some(address) = entry.resolved else {
                if entry.pending.is_empty() {
                    continue;
                }
                return Err(MapScriptError::LabelUnresolved {
                    map: self.map.to_string(),
                    unit: self.name.clone(),
                    label: *label,
                });
            };
            if address > u16::MAX as u32 {
                log::warn!(
                    "{}: unit '{}' label #{} at {} does not fit its 16-bit slot",
                    self.map,
                    self.name,
                    label,
                    address
                );
            }
            let low = (address as u16).to_be_bytes();
            for slot in &entry.pending {
                self.code[slot + 2..slot + LABEL_SLOT_WIDTH].copy_from_slice(&low);
            }
        }
        Ok(())
    }

    fn label_address(&self, label: u32) -> Result<u32> {
        self.labels
            .get(&label)
            .and_then(|entry| entry.resolved)
            .ok_or_else(|| MapScriptError::LabelUnresolved {
                map: self.map.to_string(),
                unit: self.name.clone(),
                label,
            })
    }

    fn encode_block(&mut self, src: &mut LineSource) -> Result<()> {
        loop {
            let Some((line_no, text)) = src.next() else {
                return Err(self.syntax(format!("block of unit '{}' is never closed", self.name)));
            };
            self.line = line_no;
            match text.as_str() {
                "}" => return Ok(()),
                "{" => return Err(self.syntax("'{' without a preceding if")),
                _ => self.encode_statement(&text, src)?,
            }
        }
    }

    /// Reserve the u32 block length, encode an optional `{ ... }` block and
    /// fill the length in.
    fn encode_nested(&mut self, src: &mut LineSource) -> Result<()> {
        let at = self.code.len();
        self.emit_u32(0);
        let start = self.code.len();
        if src.peek_text() == Some("{") {
            src.next();
            self.encode_block(src)?;
        }
        let len = u32::try_from(self.code.len() - start)
            .map_err(|_| self.syntax("block exceeds the 32-bit length limit"))?;
        self.code[at..at + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }

    fn encode_statement(&mut self, text: &str, src: &mut LineSource) -> Result<()> {
        let tokens = self.tokens(text)?;
        let mut cur = Cursor::new(&tokens);

        match cur.peek() {
            Some(Token::Label(label)) => {
                let label = *label;
                cur.next();
                cur.expect_sym(":").map_err(|m| self.syntax(m))?;
                cur.expect_end().map_err(|m| self.syntax(m))?;
                return self.define_label(label);
            }
            Some(Token::Sym("@")) => {
                cur.next();
                self.encode_marker(&mut cur)?;
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "if" => {
                    cur.next();
                    return self.encode_if(&mut cur, src);
                }
                "goto" | "end" => {
                    cur.next();
                    self.code.push(if word == "goto" { OP_GOTO } else { OP_END });
                    if cur.at_end() {
                        self.emit_u32(0);
                    } else {
                        let label = cur.expect_label().map_err(|m| self.syntax(m))?;
                        self.use_label(label);
                    }
                }
                "gosub" => {
                    cur.next();
                    let label = cur.expect_label().map_err(|m| self.syntax(m))?;
                    self.code.push(OP_GOSUB);
                    self.use_label(label);
                }
                "return" => {
                    cur.next();
                    self.code.push(OP_RETURN);
                }
                "endint" => {
                    cur.next();
                    self.code.push(OP_ENDINT);
                }
                "async" => {
                    cur.next();
                    self.encode_call_statement(&mut cur, OP_ASYNC_CALL)?;
                }
                "call" => {
                    cur.next();
                    self.encode_call_statement(&mut cur, OP_FUNCTION_CALL)?;
                }
                _ => self.encode_plain_statement(&mut cur)?,
            },
            _ => self.encode_plain_statement(&mut cur)?,
        }

        cur.expect_end().map_err(|m| self.syntax(m))
    }

    fn encode_marker(&mut self, cur: &mut Cursor) -> Result<()> {
        match cur.next() {
            Some(Token::Ident(word)) if word == "anchor" => {
                let value = cur.signed_int().map_err(|m| self.syntax(m))?;
                let value = self.small(value, "anchor")?;
                self.code.push(OP_ANCHOR);
                self.code.push(value);
            }
            Some(Token::Ident(word)) if word == "pause" => {
                let label = cur.expect_label().map_err(|m| self.syntax(m))?;
                self.code.push(OP_TASK_PAUSE);
                self.use_label(label);
            }
            _ => return Err(self.syntax("expected '@anchor n' or '@pause #N'")),
        }
        Ok(())
    }

    fn encode_if(&mut self, cur: &mut Cursor, src: &mut LineSource) -> Result<()> {
        if matches!(cur.peek(), Some(Token::ScriptRv)) {
            cur.next();
            cur.expect_sym("=").map_err(|m| self.syntax(m))?;
            let value = cur.signed_int().map_err(|m| self.syntax(m))?;
            let value = self.small(value, "result value")?;
            cur.expect_end().map_err(|m| self.syntax(m))?;
            self.code.push(OP_RESULT_BRANCH);
            self.code.push(value);
            return self.encode_nested(src);
        }

        self.code.push(OP_IF);
        loop {
            let left = parse_expr(cur).map_err(|m| self.syntax(m))?;
            let cmp = match cur.next() {
                Some(Token::Sym(sym)) => comparator_code(sym),
                _ => None,
            }
            .ok_or_else(|| self.syntax("expected a comparator"))?;
            let right = parse_expr(cur).map_err(|m| self.syntax(m))?;

            self.encode_expr(&left, ValueMode::LeftOperand, None)?;
            self.code.push(cmp);
            self.encode_expr(&right, ValueMode::RightOperand, None)?;

            match cur.peek() {
                Some(Token::Ident(word)) if word == "and" => {
                    cur.next();
                    self.code.push(CONJUNCTION_AND);
                }
                Some(Token::Ident(word)) if word == "or" => {
                    cur.next();
                    self.code.push(CONJUNCTION_OR);
                }
                None => {
                    self.code.push(CONJUNCTION_END);
                    break;
                }
                Some(token) => return Err(self.syntax(format!("unexpected {:?} in condition", token))),
            }
        }

        self.encode_nested(src)
    }

    fn encode_call_statement(&mut self, cur: &mut Cursor, op: u8) -> Result<()> {
        match parse_operand(cur).map_err(|m| self.syntax(m))? {
            Operand::Call(call) => {
                self.code.push(op);
                self.encode_call(&call)
            }
            Operand::ObjectCall(object, call) => {
                self.code.push(OP_OBJECT_CALL);
                self.encode_object(&object)?;
                self.code.push(op);
                self.encode_call(&call)
            }
            _ => Err(self.syntax("expected a routine call")),
        }
    }

    fn encode_plain_statement(&mut self, cur: &mut Cursor) -> Result<()> {
        let operand = parse_operand(cur).map_err(|m| self.syntax(m))?;

        if cur.eat_sym("=") {
            let formula = parse_expr(cur).map_err(|m| self.syntax(m))?;
            self.encode_target(&operand)?;
            return self.encode_expr(&formula, ValueMode::Formula, None);
        }

        match operand {
            Operand::Call(call) => {
                self.code.push(OP_TASK_CALL);
                self.encode_call(&call)
            }
            Operand::ObjectCall(object, call) => {
                self.code.push(OP_OBJECT_CALL);
                self.encode_object(&object)?;
                self.code.push(OP_TASK_CALL);
                self.encode_call(&call)
            }
            _ => Err(self.syntax("expected a call or an assignment")),
        }
    }

    fn encode_target(&mut self, operand: &Operand) -> Result<()> {
        match operand {
            Operand::Name(_) | Operand::Var(_) | Operand::Field(..) => {
                self.encode_operand(operand, ValueMode::Main, None)
            }
            _ => Err(self.syntax("only a flag, variable or field can be assigned")),
        }
    }

    fn encode_call(&mut self, call: &Call) -> Result<()> {
        let ordinal = self.resolve(SymbolTable::Routines, &call.name, "routine", u16::MAX as usize)?;
        self.emit_u16(ordinal as u16);

        if ordinal == 0 {
            if !call.args.is_empty() {
                return Err(self.syntax(format!("{} takes no arguments", call.name)));
            }
            return Ok(());
        }

        let count = u8::try_from(call.args.len())
            .map_err(|_| self.syntax(format!("too many arguments to {}", call.name)))?;
        if let Some(routine) = self.catalog.routine(ordinal) {
            if routine.param_count != count {
                log::debug!(
                    "{} line {}: {} declared with {} parameters, called with {}",
                    self.map,
                    self.line,
                    call.name,
                    routine.param_count,
                    count
                );
            }
        }
        self.code.push(count);

        for (index, arg) in call.args.iter().enumerate() {
            let kind = self.catalog.argument_kind(&call.name, index);
            self.encode_expr(arg, ValueMode::CallParameter, kind)?;
        }
        Ok(())
    }

    fn encode_object(&mut self, object: &Object) -> Result<()> {
        match object {
            Object::Builtin(code) => {
                self.code.extend_from_slice(&[OBJECT_BUILTIN, *code, 0]);
            }
            Object::Custom(name) => {
                let index = self.intern(name) as u32;
                self.code.push(OBJECT_CUSTOM);
                self.emit_u32(index);
            }
            Object::Dynamic(value) => {
                self.code.push(OBJECT_DYNAMIC);
                self.encode_operand(value, ValueMode::Reference, None)?;
            }
        }
        Ok(())
    }

    fn encode_expr(&mut self, expr: &Expr, mode: ValueMode, kind: Option<ArgumentKind>) -> Result<()> {
        self.encode_operand(&expr.head, mode, kind)?;
        for (op, operand) in &expr.tail {
            if !mode.takes_operators() {
                return Err(self.syntax("arithmetic is not allowed in call arguments"));
            }
            self.code.push(*op);
            self.encode_operand(operand, mode, kind)?;
        }
        Ok(())
    }

    fn encode_operand(&mut self, operand: &Operand, mode: ValueMode, kind: Option<ArgumentKind>) -> Result<()> {
        let in_call = mode == ValueMode::CallParameter;
        match operand {
            Operand::Int(value) => {
                self.code.push(if in_call && kind.is_some() { OP_FLEXIBLE } else { OP_LITERAL });
                self.emit_i32(*value)?;
            }
            Operand::Str(text) => {
                let index = self.intern(text);
                if in_call && kind == Some(ArgumentKind::Dialogue) {
                    self.code.push(OP_FLEXIBLE);
                    self.emit_i32(index as i64)?;
                } else {
                    self.code.push(OP_STRING);
                    self.emit_u32(index as u32);
                }
            }
            Operand::Name(name) => {
                let ordinal = self.resolve(SymbolTable::Flags, name, "flag", u16::MAX as usize)?;
                self.code.push(OP_FLAG);
                self.emit_u16(ordinal as u16);
                if in_call {
                    self.code.extend_from_slice(&[0, 0]);
                }
            }
            Operand::Var(slot) => {
                self.code.extend_from_slice(&[OP_VARIABLE, *slot]);
                if in_call {
                    self.code.extend_from_slice(&[0, 0, 0]);
                }
            }
            Operand::Field(object, reference) => {
                self.code.push(OP_OBJECT_FIELD);
                self.encode_object(object)?;
                let ordinal = self.resolve(SymbolTable::References, reference, "ref", u8::MAX as usize)?;
                self.emit_u16(ordinal as u16);
            }
            Operand::Call(call) => {
                self.code.push(OP_FUNCTION_CALL);
                self.encode_call(call)?;
            }
            Operand::ObjectCall(object, call) => {
                self.code.push(OP_OBJECT_CALL);
                self.encode_object(object)?;
                self.code.push(OP_FUNCTION_CALL);
                self.encode_call(call)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Preamble
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Preamble {
    instances: u32,
    kind: u8,
    entry: Option<u32>,
    entry_label: Option<u32>,
    strings: Vec<String>,
    variables: Vec<i32>,
    attributes: Vec<u8>,
}

impl<'a> UnitAssembler<'a> {
    fn preamble_line(&mut self, text: &str, pre: &mut Preamble) -> Result<()> {
        let tokens = self.tokens(text)?;
        let mut cur = Cursor::new(&tokens);
        let Some(Token::Ident(key)) = cur.next() else {
            return Err(self.syntax(format!("unexpected line '{}' before the unit body", text)));
        };

        match key.as_str() {
            "instances" => {
                cur.expect_sym("=").map_err(|m| self.syntax(m))?;
                let value = cur.signed_int().map_err(|m| self.syntax(m))?;
                pre.instances = u32::try_from(value)
                    .map_err(|_| self.syntax(format!("instance count {} out of range", value)))?;
            }
            "kind" => {
                cur.expect_sym("=").map_err(|m| self.syntax(m))?;
                let value = cur.signed_int().map_err(|m| self.syntax(m))?;
                pre.kind = self.small(value, "kind")?;
            }
            "entry" => {
                cur.expect_sym("=").map_err(|m| self.syntax(m))?;
                match cur.next() {
                    Some(Token::Label(label)) => pre.entry_label = Some(*label),
                    Some(Token::Int(value)) => {
                        pre.entry = Some(u32::try_from(*value).map_err(|_| self.syntax("entry out of range"))?)
                    }
                    _ => return Err(self.syntax("expected '#N' or an address after 'entry ='")),
                }
            }
            "strings" => {
                cur.expect_sym("=").map_err(|m| self.syntax(m))?;
                loop {
                    match cur.next() {
                        Some(Token::Str(s)) => pre.strings.push(s.clone()),
                        _ => return Err(self.syntax("expected a quoted string")),
                    }
                    if cur.at_end() {
                        break;
                    }
                    cur.expect_sym(",").map_err(|m| self.syntax(m))?;
                }
            }
            "variables" => {
                cur.expect_sym("(").map_err(|m| self.syntax(m))?;
                let count = cur.signed_int().map_err(|m| self.syntax(m))?;
                let count = usize::try_from(count).map_err(|_| self.syntax("negative variable count"))?;
                cur.expect_sym(")").map_err(|m| self.syntax(m))?;
                let mut values = Vec::new();
                if cur.eat_sym("=") {
                    loop {
                        let value = cur.signed_int().map_err(|m| self.syntax(m))?;
                        values.push(
                            i32::try_from(value)
                                .map_err(|_| self.syntax(format!("{} does not fit a 32-bit integer", value)))?,
                        );
                        if cur.at_end() {
                            break;
                        }
                        cur.expect_sym(",").map_err(|m| self.syntax(m))?;
                    }
                }
                if values.len() > count {
                    return Err(self.syntax(format!(
                        "{} variable values given for {} slots",
                        values.len(),
                        count
                    )));
                }
                values.resize(count, 0);
                pre.variables = values;
            }
            attribute => {
                let index = self.resolve(SymbolTable::Attributes, attribute, "attr", ATTRIBUTE_COUNT - 1)?;
                cur.expect_sym("=").map_err(|m| self.syntax(m))?;
                let value = cur.signed_int().map_err(|m| self.syntax(m))?;
                pre.attributes[index] = self.small(value, "attribute value")?;
            }
        }

        cur.expect_end().map_err(|m| self.syntax(m))
    }
}

fn unit_name(tokens: &[Token]) -> Option<String> {
    match tokens {
        [Token::Ident(key), Token::Str(name)] if key == "unit" => Some(name.clone()),
        _ => None,
    }
}

fn assemble_unit(
    catalog: &SymbolCatalog,
    map: &str,
    name: String,
    line: usize,
    src: &mut LineSource,
) -> Result<Unit> {
    let mut asm = UnitAssembler::new(catalog, map, name, line);
    let mut pre = Preamble {
        instances: 1,
        attributes: vec![0; ATTRIBUTE_COUNT],
        ..Preamble::default()
    };

    loop {
        let Some((line_no, text)) = src.next() else {
            return Err(asm.syntax(format!("unit '{}' has no body", asm.name)));
        };
        asm.line = line_no;
        if text == "{" {
            break;
        }
        asm.preamble_line(&text, &mut pre)?;
    }

    // Seeded strings keep their original indices.
    asm.strings = std::mem::take(&mut pre.strings);
    asm.encode_block(src)?;
    asm.patch_labels()?;

    let entry_pc = match (pre.entry_label, pre.entry) {
        (Some(label), _) => asm.label_address(label)?,
        (None, Some(address)) => address,
        (None, None) => 0,
    };

    log::debug!(
        "{}: unit '{}' assembled to {} bytes, {} strings",
        map,
        asm.name,
        asm.code.len(),
        asm.strings.len()
    );

    Ok(Unit {
        header: UnitHeader {
            name: asm.name,
            instance_count: pre.instances,
            script_length: asm.code.len() as u32,
            entry_pc,
            kind: pre.kind,
            ..UnitHeader::default()
        },
        strings: asm.strings,
        variables: pre.variables,
        code: asm.code,
        attributes: pre.attributes,
    })
}

/// Assemble a map's full text back into units. Script offsets are the
/// running total of earlier units' lengths.
pub fn assemble_units(catalog: &SymbolCatalog, lines: &[String], map: &str) -> Result<Vec<Unit>> {
    let mut src = LineSource {
        lines: prepare_lines(catalog, lines, map)?,
        pos: 0,
    };
    let mut units = Vec::new();
    let mut offset = 0u32;

    while let Some((line_no, text)) = src.next() {
        let name = tokenize(&text).ok().and_then(|tokens| unit_name(&tokens));
        let Some(name) = name else {
            return Err(MapScriptError::Syntax {
                map: map.to_string(),
                line: line_no,
                message: format!("expected 'unit \"Name\"', found '{}'", text),
            });
        };

        let mut unit = assemble_unit(catalog, map, name, line_no, &mut src)?;
        unit.header.script_data_offset = offset;
        offset = offset
            .checked_add(unit.header.script_length)
            .ok_or_else(|| MapScriptError::Bounds(format!("{}: code exceeds 4 GiB", map)))?;
        units.push(unit);
    }

    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::{disassemble_unit_text, disassemble_units};
    use crate::symbols::tests::sample_catalog;

    fn text(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    fn assemble_body(body: &[&str]) -> Unit {
        let mut lines = vec!["unit \"Keeper\"", "instances = 1", "{"];
        lines.extend_from_slice(body);
        lines.push("}");
        let mut units = assemble_units(&sample_catalog(), &text(&lines), "island").unwrap();
        units.remove(0)
    }

    #[test]
    fn pre_pass_rewrites() {
        assert_eq!(strip_comment("Message(\"a // b\") // Hello"), "Message(\"a // b\")");
        assert_eq!(strip_comment("Wait(1,   2)"), "Wait(1,2)");
        assert_eq!(expand_compound("var1++".to_string()), "var1 = var1 + 1");
        assert_eq!(expand_compound("Lit -= var2".to_string()), "Lit = Lit - var2");
        assert_eq!(expand_compound("if var1 >= 2".to_string()), "if var1 >= 2");

        let cat = sample_catalog();
        assert_eq!(
            substitute_brackets(&cat, "Warp(<CASTLE>, <Key>)", "m", 1).unwrap(),
            "Warp(1, 2)"
        );
        assert_eq!(
            substitute_brackets(&cat, "if <ScriptRv> = 1", "m", 1).unwrap(),
            "if <ScriptRv> = 1"
        );
        assert_eq!(
            substitute_brackets(&cat, "if var1 <= 2", "m", 1).unwrap(),
            "if var1 <= 2"
        );
        assert!(matches!(
            substitute_brackets(&cat, "GiveItem(<Elixir>, 1)", "m", 7),
            Err(MapScriptError::UnknownSymbol { line: 7, .. })
        ));
    }

    #[test]
    fn non_ascii_text_is_a_syntax_error() {
        assert_eq!(find_outside_quotes("Épée += 1", "+="), Some(7));
        assert_eq!(find_outside_quotes("Message(\"é += 1\")", "+="), None);

        for (line, body) in [
            (4, "GiveItem(<Épée>, 1)"),
            (4, "Épée += 1"),
            (4, "Lit = Ärger"),
        ] {
            let lines = text(&["unit \"Keeper\"", "{", "return", body, "}"]);
            match assemble_units(&sample_catalog(), &lines, "island") {
                Err(MapScriptError::Syntax { line: at, .. }) => assert_eq!(at, line),
                other => panic!("'{}' gave {:?}", body, other),
            }
        }

        let unit = assemble_body(&["Message(\"Épée\")"]);
        assert_eq!(unit.strings, vec!["Épée".to_string()]);
    }

    #[test]
    fn door_scenario_bytes() {
        let unit = assemble_body(&[
            "Door1 = 1",
            "if Lit = 1 and Door1 = 1",
            "{",
            "OpenDoor()",
            "}",
        ]);
        assert_eq!(
            unit.code,
            vec![
                6, 0, 0, 7, 0, 0, 0, 1, //
                3, 6, 0, 1, 0, 7, 0, 0, 0, 1, 1, 6, 0, 0, 0, 7, 0, 0, 0, 1, 0, //
                0, 0, 0, 4, //
                0, 0, 1, 0,
            ]
        );
    }

    #[test]
    fn labels_are_backpatched_from_their_definition() {
        let unit = assemble_body(&["goto #90", "return", "#90:", "gosub #90", "goto"]);
        assert_eq!(
            unit.code,
            vec![
                0x04, 0, 0, 0, 6, // goto -> 6
                0x0D, //
                0x0F, 0, 0, 0, 6, // gosub -> 6
                0x04, 0, 0, 0, 0, // no target
            ]
        );
    }

    #[test]
    fn label_past_16_bits_keeps_the_low_bytes() {
        let mut body = vec!["goto #1"];
        body.extend(std::iter::repeat("return").take(0x10000));
        body.extend(["#1:", "endint"]);
        let unit = assemble_body(&body);

        assert_eq!(unit.code.len(), 5 + 0x10000 + 1);
        // #1 sits at 0x10005; only 0x0005 fits the slot.
        assert_eq!(unit.code[..5], [0x04, 0, 0, 0x00, 0x05]);
        assert_eq!(unit.code[0x10005], 0x0E);
    }

    #[test]
    fn undefined_label_is_reported() {
        let lines = text(&["unit \"Keeper\"", "{", "@pause #7", "}"]);
        match assemble_units(&sample_catalog(), &lines, "island") {
            Err(MapScriptError::LabelUnresolved { unit, label, .. }) => {
                assert_eq!(unit, "Keeper");
                assert_eq!(label, 7);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn duplicate_label_is_a_syntax_error() {
        let lines = text(&["unit \"Keeper\"", "{", "#1:", "return", "#1:", "}"]);
        assert!(matches!(
            assemble_units(&sample_catalog(), &lines, "island"),
            Err(MapScriptError::Syntax { line: 5, .. })
        ));
    }

    #[test]
    fn unknown_routine_names_the_line() {
        let lines = text(&["unit \"Keeper\"", "{", "return", "Explode()", "}"]);
        match assemble_units(&sample_catalog(), &lines, "island") {
            Err(MapScriptError::UnknownSymbol { map, line, name }) => {
                assert_eq!(map, "island");
                assert_eq!(line, 4);
                assert_eq!(name, "Explode");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn typed_arguments_use_flexible_literals() {
        let unit = assemble_body(&[
            "Message(\"EV_002\") // Farewell.",
            "GiveItem(<Ether>, 2)",
            "Wait(Lit, var3)",
        ]);
        assert_eq!(unit.strings, vec!["EV_002".to_string()]);
        assert_eq!(
            unit.code,
            vec![
                0, 0, 2, 1, 8, 0, 0, 0, 0, //
                0, 0, 3, 2, 8, 0, 0, 0, 1, 7, 0, 0, 0, 2, //
                0, 0, 7, 2, 6, 0, 1, 0, 0, 9, 3, 0, 0, 0,
            ]
        );
    }

    #[test]
    fn compound_assignment_and_objects() {
        let unit = assemble_body(&["var1 += 2", "async \"Barrel\".Roll(var2)", "self.Speed--"]);
        assert_eq!(
            unit.code,
            vec![
                9, 1, 9, 1, 0x20, 7, 0, 0, 0, 2, //
                0x0C, 1, 0, 0, 0, 0, 1, 0, 6, 1, 9, 2, 0, 0, 0, //
                0x0B, 0, 0, 0, 0, 1, 0x0B, 0, 0, 0, 0, 1, 0x21, 7, 0, 0, 0, 1,
            ]
        );
        assert_eq!(unit.strings, vec!["Barrel".to_string()]);
    }

    #[test]
    fn preamble_fields() {
        let lines = text(&[
            "unit \"Keeper\"",
            "instances = 3",
            "kind = 2",
            "entry = #1",
            "strings = \"a\", \"b\"",
            "variables(4) = 7, -1",
            "Visible = 9",
            "attr200 = 1",
            "{",
            "return",
            "#1:",
            "endint",
            "}",
        ]);
        let unit = assemble_units(&sample_catalog(), &lines, "island").unwrap().remove(0);
        assert_eq!(unit.header.instance_count, 3);
        assert_eq!(unit.header.kind, 2);
        assert_eq!(unit.header.entry_pc, 1);
        assert_eq!(unit.strings, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(unit.variables, vec![7, -1, 0, 0]);
        assert_eq!(unit.attributes[3], 9);
        assert_eq!(unit.attributes[200], 1);
        assert_eq!(unit.code, vec![0x0D, 0x0E]);
    }

    #[test]
    fn if_without_block_is_empty() {
        let unit = assemble_body(&["if var1 = 0", "return"]);
        assert_eq!(
            unit.code,
            vec![3, 9, 1, 0, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x0D]
        );
    }

    #[test]
    fn offsets_run_across_units() {
        let lines = text(&[
            "unit \"A\"",
            "{",
            "return",
            "}",
            "",
            "unit \"B\"",
            "{",
            "endint",
            "return",
            "}",
        ]);
        let units = assemble_units(&sample_catalog(), &lines, "island").unwrap();
        assert_eq!(units[0].header.script_data_offset, 0);
        assert_eq!(units[1].header.script_data_offset, 1);
        assert_eq!(units[1].header.script_length, 2);
    }

    #[test]
    fn text_is_stable_over_a_round_trip() {
        let cat = sample_catalog();
        let source = text(&[
            "unit \"Keeper\"",
            "instances = 2",
            "entry = #5",
            "strings = \"Barrel\", \"EV_001\"",
            "variables(3) = 0, 5",
            "Solid = 1",
            "{",
            "    Door1 = 1",
            "    if Lit = 1 and Door1 = 1 or var1 != 3 + var2",
            "    {",
            "        OpenDoor()",
            "        if <ScriptRv> = 2",
            "        {",
            "            goto #5",
            "        }",
            "    }",
            "    #5:",
            "    Message(\"EV_001\") // Welcome, traveller.",
            "    Warp(<CASTLE>, 4)",
            "    call Random(-3)",
            "    var2 = Random(7) * 2",
            "    async \"Barrel\".Roll(var2)",
            "    player.Health = var1.Speed",
            "    @anchor 3",
            "    @pause #5",
            "    end",
            "}",
        ]);
        let units = assemble_units(&cat, &source, "island").unwrap();
        let first = disassemble_units(&cat, &units).unwrap();
        let again = assemble_units(&cat, &first, "island").unwrap();
        assert_eq!(units, again);
        assert_eq!(disassemble_unit_text(&cat, &again[0]).unwrap(), first);
    }
}
