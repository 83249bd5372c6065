use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

pub mod asm;
pub mod container;
pub mod disasm;
pub mod header;
pub mod opcode;
pub mod params;
pub mod patch;
pub mod symbols;

pub use container::MapContainer;
pub use header::{decode_units, Unit, UnitHeader};
pub use patch::{PatchEntry, PatchSet, PatchWarning};
pub use symbols::SymbolCatalog;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Directory holding routines.txt, flags.txt, items.txt, maps.txt,
    /// references.txt, attributes.txt and optionally dialogue.txt.
    pub definitions_path: PathBuf,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default = "default_map_extension")]
    pub map_extension: String,
    /// Patch files, directories of `*.patch` files or `.zip` mod archives,
    /// in priority order; later sources append after earlier ones.
    #[serde(default)]
    pub patch_sources: Vec<PathBuf>,
    #[serde(default)]
    pub recompile_all: bool,
    #[serde(default)]
    pub dump_text: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_map_extension() -> String {
    "map".to_string()
}

impl CompilerSettings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Error)]
pub enum MapScriptError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated chunk '{tag}' at offset {offset}")]
    TruncatedChunk { tag: String, offset: usize },
    #[error("bounds error: {0}")]
    Bounds(String),
    #[error("unknown opcode 0x{opcode:02X} in unit '{unit}' at offset {offset}")]
    UnknownOpcode { unit: String, offset: usize, opcode: u8 },
    #[error("unknown symbol '{name}' in {map} line {line}")]
    UnknownSymbol { map: String, line: usize, name: String },
    #[error("syntax error in {map} line {line}: {message}")]
    Syntax {
        map: String,
        line: usize,
        message: String,
    },
    #[error("label #{label} is used but never defined in unit '{unit}' of {map}")]
    LabelUnresolved { map: String, unit: String, label: u32 },
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, MapScriptError>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Maps re-encoded and written.
    pub written: usize,
    /// Maps copied unchanged because nothing patched them.
    pub copied: usize,
    /// Maps whose re-encoding failed; the original bytes were copied.
    pub failed: usize,
    pub patch_warnings: usize,
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// Every map container under `root`, in sorted path order.
fn find_maps(root: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut maps = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() && has_extension(entry.path(), ext) {
            maps.push(entry.path().to_path_buf());
        }
    }
    Ok(maps)
}

fn map_name_of(path: &Path) -> String {
    patch::map_key(&path.to_string_lossy())
}

/// Read a container and render every unit as text.
pub fn dump_map(catalog: &SymbolCatalog, path: &Path) -> Result<Vec<String>> {
    let container = MapContainer::read(path)?;
    let units = decode_units(&container)?;
    disasm::disassemble_units(catalog, &units)
}

/// Re-encode a container's own disassembly and compare the bytes.
pub fn roundtrip_map(catalog: &SymbolCatalog, path: &Path) -> Result<bool> {
    let raw = fs::read(path)?;
    let container = MapContainer::parse(&raw)?;
    let units = decode_units(&container)?;
    let text = disasm::disassemble_units(catalog, &units)?;
    let reassembled = asm::assemble_units(catalog, &text, &map_name_of(path))?;

    let mut rebuilt = container.clone();
    rebuilt.replace_units(&reassembled)?;
    Ok(rebuilt.to_bytes()? == raw)
}

/// Disassemble, patch and reassemble one container. Any error leaves the
/// caller to fall back to the original bytes.
fn recompile(
    catalog: &SymbolCatalog,
    patches: &PatchSet,
    map: &str,
    container: &MapContainer,
    units: &[Unit],
    settings: &CompilerSettings,
    out_path: &Path,
) -> Result<Vec<u8>> {
    let before = disasm::disassemble_units(catalog, units)?;
    let after = patch::apply(&before, patches, map);

    if settings.dump_text {
        write_file(&out_path.with_extension("before.txt"), before.join("\n").as_bytes())?;
        write_file(&out_path.with_extension("after.txt"), after.join("\n").as_bytes())?;
    }

    let reassembled = asm::assemble_units(catalog, &after, map)?;
    let mut rebuilt = container.clone();
    rebuilt.replace_units(&reassembled)?;
    rebuilt.to_bytes()
}

pub fn run(settings: CompilerSettings) -> Result<RunSummary> {
    if !settings.input_path.exists() {
        return Err(MapScriptError::Config(format!(
            "Input path does not exist: {}",
            settings.input_path.display()
        )));
    }
    if !settings.output_path.exists() {
        fs::create_dir_all(&settings.output_path)?;
    }

    let mut log = String::new();
    let mut summary = RunSummary::default();

    let catalog = SymbolCatalog::load(&settings.definitions_path)?;

    let (patches, warnings) = patch::load_patch_sources(&settings.patch_sources)?;
    summary.patch_warnings = warnings.len();
    for w in &warnings {
        log.push_str(&format!("skipped patch line {}:{}: {:?}\n", w.source, w.line, w.text));
    }

    let maps = find_maps(&settings.input_path, &settings.map_extension)?;
    log::info!(
        "{} map(s) under {}, patches for {} map(s)",
        maps.len(),
        settings.input_path.display(),
        patches.map_names().count()
    );

    let known: Vec<String> = maps.iter().map(|p| map_name_of(p)).collect();
    for name in patches.map_names() {
        if !known.iter().any(|k| k == name) {
            log::warn!("patches target map '{}' which is not in the input", name);
            log.push_str(&format!("no container for patched map '{}'\n", name));
        }
    }

    for path in &maps {
        let relative = path.strip_prefix(&settings.input_path).unwrap_or(path);
        let out_path = settings.output_path.join(relative);
        let map = map_name_of(path);

        let raw = fs::read(path)?;
        let container = MapContainer::parse(&raw)?;
        let units = decode_units(&container)?;

        if !settings.recompile_all && !patches.has_map(&map) {
            write_file(&out_path, &raw)?;
            summary.copied += 1;
            continue;
        }

        match recompile(&catalog, &patches, &map, &container, &units, &settings, &out_path) {
            Ok(bytes) => {
                log::info!("{}: {} unit(s) recompiled", map, units.len());
                log.push_str(&format!("{}: recompiled {} unit(s), {} bytes\n", map, units.len(), bytes.len()));
                write_file(&out_path, &bytes)?;
                summary.written += 1;
            }
            Err(e) => {
                log::error!("{}: {}; copying the original", map, e);
                log.push_str(&format!("{}: FAILED ({}), original copied\n", map, e));
                write_file(&out_path, &raw)?;
                summary.failed += 1;
            }
        }
    }

    log.push_str(&format!(
        "written {}, copied {}, failed {}, patch warnings {}\n",
        summary.written, summary.copied, summary.failed, summary.patch_warnings
    ));

    if settings.debug {
        let log_path = settings.output_path.join("compile_log.txt");
        fs::write(log_path, log)?;
    }

    Ok(summary)
}
