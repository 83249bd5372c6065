use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::opcode::{builtin_object_code, variable_slot};
use crate::params::{argument_kind, ArgumentKind};
use crate::{MapScriptError, Result};

pub const ROUTINES_FILE: &str = "routines.txt";
pub const FLAGS_FILE: &str = "flags.txt";
pub const ITEMS_FILE: &str = "items.txt";
pub const MAPS_FILE: &str = "maps.txt";
pub const REFERENCES_FILE: &str = "references.txt";
pub const ATTRIBUTES_FILE: &str = "attributes.txt";
pub const DIALOGUE_FILE: &str = "dialogue.txt";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SymbolTable {
    Routines,
    Flags,
    Items,
    MapTargets,
    References,
    Attributes,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoutineKind {
    /// Blocking call issued as a statement.
    Task,
    /// Value-returning call usable inside formulas.
    Function,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutineSymbol {
    pub name: String,
    pub param_count: u8,
    pub kind: RoutineKind,
}

/// Raw text of every definition source. The dialogue database is optional.
#[derive(Clone, Debug, Default)]
pub struct CatalogSources {
    pub routines: String,
    pub flags: String,
    pub items: String,
    pub maps: String,
    pub references: String,
    pub attributes: String,
    pub dialogue: Option<String>,
}

impl CatalogSources {
    pub fn read_dir(dir: &Path) -> Result<Self> {
        let read = |file: &str| -> Result<String> {
            let path = dir.join(file);
            fs::read_to_string(&path).map_err(|e| {
                MapScriptError::Catalog(format!("cannot read {}: {}", path.display(), e))
            })
        };

        let dialogue_path = dir.join(DIALOGUE_FILE);
        let dialogue = match fs::read_to_string(&dialogue_path) {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!(
                    "dialogue database {} unavailable ({}); disassembly will carry no comments",
                    dialogue_path.display(),
                    e
                );
                None
            }
        };

        Ok(Self {
            routines: read(ROUTINES_FILE)?,
            flags: read(FLAGS_FILE)?,
            items: read(ITEMS_FILE)?,
            maps: read(MAPS_FILE)?,
            references: read(REFERENCES_FILE)?,
            attributes: read(ATTRIBUTES_FILE)?,
            dialogue,
        })
    }
}

#[derive(Clone, Debug, Default)]
struct NameTable {
    names: Vec<Option<String>>,
    ordinals: HashMap<String, usize>,
}

impl NameTable {
    fn insert(&mut self, ordinal: usize, name: &str, source: &str) -> Result<()> {
        if self.names.len() <= ordinal {
            self.names.resize(ordinal + 1, None);
        }
        if self.names[ordinal].is_some() {
            return Err(MapScriptError::Catalog(format!(
                "{}: ordinal {} is defined twice",
                source, ordinal
            )));
        }
        if self.ordinals.contains_key(name) {
            // Keep the first ordinal for name->ordinal lookups; the later
            // one still decodes by ordinal.
            log::warn!("{}: name '{}' is defined more than once", source, name);
        } else {
            self.ordinals.insert(name.to_string(), ordinal);
        }
        self.names[ordinal] = Some(name.to_string());
        Ok(())
    }

    fn name(&self, ordinal: usize) -> Option<&str> {
        self.names.get(ordinal).and_then(|n| n.as_deref())
    }

    fn ordinal(&self, name: &str) -> Option<usize> {
        self.ordinals.get(name).copied()
    }
}

/// One meaningful definition line: optional explicit `N =` ordinal and the
/// remaining text. Blank lines and `#` / `//` comments yield `None`.
fn definition_line(raw: &str) -> Option<(Option<&str>, &str)> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }
    match line.split_once('=') {
        Some((ordinal, rest)) => Some((Some(ordinal.trim()), rest.trim())),
        None => Some((None, line)),
    }
}

fn parse_ordinal(token: &str, source: &str, line_no: usize) -> Result<usize> {
    token.parse::<usize>().map_err(|_| {
        MapScriptError::Catalog(format!(
            "{} line {}: '{}' is not an ordinal",
            source, line_no, token
        ))
    })
}

/// Statement and condition keywords of the script text.
const RESERVED_WORDS: [&str; 13] = [
    "if", "and", "or", "end", "goto", "gosub", "return", "endint", "async", "call", "unit",
    "anchor", "pause",
];

/// Catalog names must read back as one identifier token
/// (`[A-Za-z_][A-Za-z0-9_]*`) that the assembler gives no other meaning.
fn check_name(name: &str, source: &str, line_no: usize) -> Result<()> {
    let mut chars = name.chars();
    let identifier = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !identifier
        || RESERVED_WORDS.contains(&name)
        || builtin_object_code(name).is_some()
        || variable_slot(name).is_some()
    {
        return Err(MapScriptError::Catalog(format!(
            "{} line {}: invalid name '{}'",
            source, line_no, name
        )));
    }
    Ok(())
}

fn parse_name_table(text: &str, source: &str) -> Result<NameTable> {
    let mut table = NameTable::default();
    let mut next = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let Some((ordinal, name)) = definition_line(raw) else {
            continue;
        };
        let ordinal = match ordinal {
            Some(tok) => parse_ordinal(tok, source, line_no)?,
            None => next,
        };
        check_name(name, source, line_no)?;
        table.insert(ordinal, name, source)?;
        next = ordinal + 1;
    }

    Ok(table)
}

fn parse_routines(text: &str) -> Result<(Vec<Option<RoutineSymbol>>, HashMap<String, usize>)> {
    let mut routines: Vec<Option<RoutineSymbol>> = Vec::new();
    let mut index = HashMap::new();
    let mut next = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let Some((ordinal, rest)) = definition_line(raw) else {
            continue;
        };
        let ordinal = match ordinal {
            Some(tok) => parse_ordinal(tok, ROUTINES_FILE, line_no)?,
            None => next,
        };

        let mut parts = rest.split_whitespace();
        let name = parts.next().ok_or_else(|| {
            MapScriptError::Catalog(format!("{} line {}: missing name", ROUTINES_FILE, line_no))
        })?;
        check_name(name, ROUTINES_FILE, line_no)?;
        let param_count = match parts.next() {
            Some(tok) => tok.parse::<u8>().map_err(|_| {
                MapScriptError::Catalog(format!(
                    "{} line {}: bad parameter count '{}'",
                    ROUTINES_FILE, line_no, tok
                ))
            })?,
            None => 0,
        };
        let kind = match parts.next().map(|k| k.to_ascii_lowercase()) {
            None => RoutineKind::Task,
            Some(k) if k == "task" => RoutineKind::Task,
            Some(k) if k == "function" => RoutineKind::Function,
            Some(other) => {
                return Err(MapScriptError::Catalog(format!(
                    "{} line {}: unknown routine kind '{}'",
                    ROUTINES_FILE, line_no, other
                )))
            }
        };

        if routines.len() <= ordinal {
            routines.resize(ordinal + 1, None);
        }
        if routines[ordinal].is_some() {
            return Err(MapScriptError::Catalog(format!(
                "{}: ordinal {} is defined twice",
                ROUTINES_FILE, ordinal
            )));
        }
        index.entry(name.to_string()).or_insert(ordinal);
        routines[ordinal] = Some(RoutineSymbol {
            name: name.to_string(),
            param_count,
            kind,
        });
        next = ordinal + 1;
    }

    Ok((routines, index))
}

fn parse_dialogue(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw in text.lines() {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let pair = line.split_once('\t').or_else(|| line.split_once('='));
        if let Some((label, body)) = pair {
            out.insert(label.trim().to_string(), body.trim().to_string());
        }
    }
    out
}

/// Ordinal-indexed name tables shared read-only by every unit.
#[derive(Clone, Debug, Default)]
pub struct SymbolCatalog {
    routines: Vec<Option<RoutineSymbol>>,
    routine_ordinals: HashMap<String, usize>,
    flags: NameTable,
    items: NameTable,
    maps: NameTable,
    references: NameTable,
    attributes: NameTable,
    dialogue: HashMap<String, String>,
}

impl SymbolCatalog {
    pub fn load(dir: &Path) -> Result<Self> {
        let sources = CatalogSources::read_dir(dir)?;
        Self::from_sources(&sources)
    }

    pub fn from_sources(sources: &CatalogSources) -> Result<Self> {
        let (routines, routine_ordinals) = parse_routines(&sources.routines)?;
        let catalog = Self {
            routines,
            routine_ordinals,
            flags: parse_name_table(&sources.flags, FLAGS_FILE)?,
            items: parse_name_table(&sources.items, ITEMS_FILE)?,
            maps: parse_name_table(&sources.maps, MAPS_FILE)?,
            references: parse_name_table(&sources.references, REFERENCES_FILE)?,
            attributes: parse_name_table(&sources.attributes, ATTRIBUTES_FILE)?,
            dialogue: sources
                .dialogue
                .as_deref()
                .map(parse_dialogue)
                .unwrap_or_default(),
        };

        // `<Name>` is shared by maps and items; a name in both tables could
        // not be re-encoded unambiguously.
        let mut collisions: Vec<&str> = catalog
            .maps
            .ordinals
            .keys()
            .filter(|name| catalog.items.ordinals.contains_key(*name))
            .map(|s| s.as_str())
            .collect();
        if !collisions.is_empty() {
            collisions.sort();
            return Err(MapScriptError::Catalog(format!(
                "names defined as both map and item: {}",
                collisions.join(", ")
            )));
        }

        log::debug!(
            "symbol catalog: {} routines, {} flags, {} items, {} maps, {} references, {} attributes, {} dialogue labels",
            catalog.routines.len(),
            catalog.flags.names.len(),
            catalog.items.names.len(),
            catalog.maps.names.len(),
            catalog.references.names.len(),
            catalog.attributes.names.len(),
            catalog.dialogue.len(),
        );

        Ok(catalog)
    }

    fn table(&self, table: SymbolTable) -> Option<&NameTable> {
        match table {
            SymbolTable::Routines => None,
            SymbolTable::Flags => Some(&self.flags),
            SymbolTable::Items => Some(&self.items),
            SymbolTable::MapTargets => Some(&self.maps),
            SymbolTable::References => Some(&self.references),
            SymbolTable::Attributes => Some(&self.attributes),
        }
    }

    pub fn lookup_by_ordinal(&self, table: SymbolTable, index: usize) -> Option<&str> {
        match self.table(table) {
            Some(t) => t.name(index),
            None => self.routine(index).map(|r| r.name.as_str()),
        }
    }

    pub fn lookup_ordinal(&self, table: SymbolTable, name: &str) -> Option<usize> {
        match self.table(table) {
            Some(t) => t.ordinal(name),
            None => self.routine_ordinals.get(name).copied(),
        }
    }

    pub fn routine(&self, ordinal: usize) -> Option<&RoutineSymbol> {
        self.routines.get(ordinal).and_then(|r| r.as_ref())
    }

    pub fn routine_by_name(&self, name: &str) -> Option<(usize, &RoutineSymbol)> {
        let ordinal = *self.routine_ordinals.get(name)?;
        self.routine(ordinal).map(|r| (ordinal, r))
    }

    pub fn dialogue_text(&self, label: &str) -> Option<&str> {
        self.dialogue.get(label).map(|s| s.as_str())
    }

    pub fn argument_kind(&self, routine: &str, index: usize) -> Option<ArgumentKind> {
        argument_kind(routine, index)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_sources() -> CatalogSources {
        CatalogSources {
            routines: "\
# ordinal 0 is the null routine
Nop 0 task
OpenDoor 0 task
Message 1 task
GiveItem 2 task
Warp 2 task
Random 1 function
Roll 1 task
Wait 1 task
"
            .to_string(),
            flags: "Door1\nLit\n".to_string(),
            items: "Potion\nEther\nKey\n".to_string(),
            maps: "ISLAND\nCASTLE\n".to_string(),
            references: "Health\nSpeed\n".to_string(),
            attributes: "0 = Solid\n3 = Visible\n".to_string(),
            dialogue: Some("EV_001\tWelcome, traveller.\nEV_002 = Farewell.\n".to_string()),
        }
    }

    pub(crate) fn sample_catalog() -> SymbolCatalog {
        SymbolCatalog::from_sources(&sample_sources()).unwrap()
    }

    #[test]
    fn looks_up_both_directions() {
        let cat = sample_catalog();
        assert_eq!(cat.lookup_by_ordinal(SymbolTable::Flags, 1), Some("Lit"));
        assert_eq!(cat.lookup_ordinal(SymbolTable::Flags, "Door1"), Some(0));
        assert_eq!(cat.lookup_ordinal(SymbolTable::MapTargets, "CASTLE"), Some(1));
        assert_eq!(cat.lookup_by_ordinal(SymbolTable::Routines, 1), Some("OpenDoor"));
        assert_eq!(cat.lookup_ordinal(SymbolTable::Routines, "Random"), Some(5));
        assert_eq!(cat.lookup_by_ordinal(SymbolTable::Items, 9), None);
    }

    #[test]
    fn explicit_ordinals_leave_gaps() {
        let cat = sample_catalog();
        assert_eq!(cat.lookup_by_ordinal(SymbolTable::Attributes, 0), Some("Solid"));
        assert_eq!(cat.lookup_by_ordinal(SymbolTable::Attributes, 1), None);
        assert_eq!(cat.lookup_ordinal(SymbolTable::Attributes, "Visible"), Some(3));
    }

    #[test]
    fn routine_metadata() {
        let cat = sample_catalog();
        let (ordinal, r) = cat.routine_by_name("Random").unwrap();
        assert_eq!(ordinal, 5);
        assert_eq!(r.param_count, 1);
        assert_eq!(r.kind, RoutineKind::Function);
        assert_eq!(cat.routine(3).unwrap().param_count, 2);
    }

    #[test]
    fn dialogue_accepts_tab_and_equals() {
        let cat = sample_catalog();
        assert_eq!(cat.dialogue_text("EV_001"), Some("Welcome, traveller."));
        assert_eq!(cat.dialogue_text("EV_002"), Some("Farewell."));
        assert_eq!(cat.dialogue_text("EV_404"), None);
    }

    #[test]
    fn missing_dialogue_is_not_fatal() {
        let mut sources = sample_sources();
        sources.dialogue = None;
        let cat = SymbolCatalog::from_sources(&sources).unwrap();
        assert_eq!(cat.dialogue_text("EV_001"), None);
    }

    #[test]
    fn rejects_map_item_collision() {
        let mut sources = sample_sources();
        sources.items.push_str("CASTLE\n");
        let err = SymbolCatalog::from_sources(&sources).unwrap_err();
        assert!(err.to_string().contains("CASTLE"));
    }

    #[test]
    fn rejects_names_the_assembler_cannot_read_back() {
        for bad in ["Door-2", "1stGate", "Lit'", "Épée", "return", "camera", "var3"] {
            let mut sources = sample_sources();
            sources.flags.push_str(bad);
            sources.flags.push('\n');
            match SymbolCatalog::from_sources(&sources) {
                Err(MapScriptError::Catalog(msg)) => {
                    assert!(msg.contains(FLAGS_FILE), "{}", msg);
                    assert!(msg.contains("line 3"), "{}", msg);
                }
                other => panic!("'{}' loaded: {:?}", bad, other.map(|_| ())),
            }
        }

        let mut sources = sample_sources();
        sources.items.push_str("Épée\n");
        assert!(matches!(
            SymbolCatalog::from_sources(&sources),
            Err(MapScriptError::Catalog(_))
        ));

        let mut sources = sample_sources();
        sources.routines.push_str("Open-Gate 0 task\n");
        assert!(matches!(
            SymbolCatalog::from_sources(&sources),
            Err(MapScriptError::Catalog(_))
        ));

        let mut sources = sample_sources();
        sources.references.push_str("var_speed\nvariable\n");
        assert!(SymbolCatalog::from_sources(&sources).is_ok());
    }

    #[test]
    fn rejects_bad_routine_kind() {
        let mut sources = sample_sources();
        sources.routines.push_str("Broken 1 coroutine\n");
        assert!(SymbolCatalog::from_sources(&sources).is_err());
    }

    #[test]
    fn load_fails_when_required_file_missing() {
        let dir = std::env::temp_dir().join("mapscript_catalog_missing");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ROUTINES_FILE), "Nop\n").unwrap();
        assert!(matches!(
            SymbolCatalog::load(&dir),
            Err(MapScriptError::Catalog(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
