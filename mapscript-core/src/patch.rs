use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use walkdir::WalkDir;

use crate::Result;

pub const PATCH_EXTENSION: &str = "patch";

/// Token that marks a deletion instead of an inserted line.
const DELETE_TOKEN: &str = "null";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchEntry {
    /// Drop the original line at this position. Only ever first in a list.
    Delete,
    /// Line emitted after the original (or deleted) line.
    Insert(String),
}

/// Patch line that did not match `position<TAB>text`; skipped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchWarning {
    pub source: String,
    pub line: usize,
    pub text: String,
}

/// Edits keyed by map, then by 1-based line position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchSet {
    maps: BTreeMap<String, BTreeMap<usize, Vec<PatchEntry>>>,
}

/// Lower-cased file stem: `maps/Island.map` and `ISLAND` both name `island`.
pub fn map_key(name: &str) -> String {
    let file = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    };
    stem.to_ascii_lowercase()
}

fn append_entry(list: &mut Vec<PatchEntry>, entry: PatchEntry) {
    match entry {
        PatchEntry::Delete => {
            if list.first() != Some(&PatchEntry::Delete) {
                list.insert(0, PatchEntry::Delete);
            }
        }
        insert => list.push(insert),
    }
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn push(&mut self, map: &str, position: usize, entry: PatchEntry) {
        let list = self
            .maps
            .entry(map_key(map))
            .or_default()
            .entry(position)
            .or_default();
        append_entry(list, entry);
    }

    pub fn has_map(&self, map: &str) -> bool {
        self.maps.contains_key(&map_key(map))
    }

    pub fn map_names(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(|k| k.as_str())
    }

    pub fn edits(&self, map: &str) -> Option<&BTreeMap<usize, Vec<PatchEntry>>> {
        self.maps.get(&map_key(map))
    }

    /// Append every edit of `other` after the edits already held. A
    /// deletion goes to the front of its list once and is never repeated.
    pub fn merge_from(&mut self, other: &PatchSet) {
        for (map, positions) in &other.maps {
            let target = self.maps.entry(map.clone()).or_default();
            for (position, entries) in positions {
                let list = target.entry(*position).or_default();
                for entry in entries {
                    append_entry(list, entry.clone());
                }
            }
        }
    }
}

/// Merge patch sets in priority order.
pub fn merge(sources: &[PatchSet]) -> PatchSet {
    let mut merged = PatchSet::new();
    for source in sources {
        merged.merge_from(source);
    }
    merged
}

/// Overlay the edits for `map` onto its original text. The result depends
/// only on `lines` and `patches`, so applying twice never compounds.
pub fn apply(lines: &[String], patches: &PatchSet, map: &str) -> Vec<String> {
    let Some(edits) = patches.edits(map) else {
        return lines.to_vec();
    };

    if let Some((&last, _)) = edits.iter().next_back() {
        if last > lines.len() || edits.contains_key(&0) {
            log::warn!(
                "patches for '{}' reach line {} but the text has {} lines; those edits are ignored",
                map,
                last,
                lines.len()
            );
        }
    }

    let mut out = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match edits.get(&(idx + 1)) {
            None => out.push(line.clone()),
            Some(entries) => {
                if entries.first() != Some(&PatchEntry::Delete) {
                    out.push(line.clone());
                }
                for entry in entries {
                    if let PatchEntry::Insert(text) = entry {
                        out.push(text.clone());
                    }
                }
            }
        }
    }
    out
}

/// Parse one patch file. A line without leading whitespace names a map;
/// indented lines are `position<TAB>text` edits for that map.
pub fn parse_patch_text(source: &str, text: &str) -> (PatchSet, Vec<PatchWarning>) {
    let mut set = PatchSet::new();
    let mut warnings = Vec::new();
    let mut current: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let raw = raw.trim_end_matches('\r');
        if raw.trim().is_empty() {
            continue;
        }

        let mut warn = |reason: &str| {
            log::warn!("{}:{}: {} ({:?})", source, line_no, reason, raw);
            warnings.push(PatchWarning {
                source: source.to_string(),
                line: line_no,
                text: raw.to_string(),
            });
        };

        if !raw.starts_with([' ', '\t']) {
            let header = raw.trim();
            if header.starts_with('#') || header.starts_with("//") {
                continue;
            }
            current = Some(map_key(header));
            continue;
        }

        let Some(map) = current.as_deref() else {
            warn("edit before any map name");
            continue;
        };
        let Some((position, body)) = raw.trim_start().split_once('\t') else {
            warn("expected position<TAB>text");
            continue;
        };
        let position = match position.trim().parse::<usize>() {
            Ok(p) if p > 0 => p,
            _ => {
                warn("line position is not a positive integer");
                continue;
            }
        };

        let entry = if body == DELETE_TOKEN {
            PatchEntry::Delete
        } else {
            PatchEntry::Insert(body.to_string())
        };
        set.push(map, position, entry);
    }

    (set, warnings)
}

fn is_patch_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(PATCH_EXTENSION))
}

/// Every `*.patch` member of a mod archive, ordered by member name.
fn read_zip_patches(path: &Path) -> Result<Vec<(String, String)>> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        if member.is_dir() || !is_patch_file(member.name()) {
            continue;
        }
        let name = format!("{}!{}", path.display(), member.name());
        let mut text = String::new();
        member.read_to_string(&mut text)?;
        files.push((name, text));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

fn read_dir_patches(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_patch_file(&path.to_string_lossy()) {
            continue;
        }
        files.push((path.display().to_string(), fs::read_to_string(path)?));
    }
    Ok(files)
}

/// Load one patch source: a single file, a directory of `*.patch` files,
/// or a `.zip` mod archive.
pub fn load_patch_source(path: &Path) -> Result<(PatchSet, Vec<PatchWarning>)> {
    let is_zip = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("zip"));

    let files = if path.is_dir() {
        read_dir_patches(path)?
    } else if is_zip {
        read_zip_patches(path)?
    } else {
        vec![(path.display().to_string(), fs::read_to_string(path)?)]
    };

    let mut set = PatchSet::new();
    let mut warnings = Vec::new();
    for (name, text) in files {
        let (parsed, mut skipped) = parse_patch_text(&name, &text);
        log::debug!("{}: edits for {} map(s)", name, parsed.maps.len());
        set.merge_from(&parsed);
        warnings.append(&mut skipped);
    }
    Ok((set, warnings))
}

/// Load and merge patch sources in the given priority order.
pub fn load_patch_sources<P: AsRef<Path>>(paths: &[P]) -> Result<(PatchSet, Vec<PatchWarning>)> {
    let mut sets = Vec::with_capacity(paths.len());
    let mut warnings = Vec::new();
    for path in paths {
        let (set, mut skipped) = load_patch_source(path.as_ref())?;
        sets.push(set);
        warnings.append(&mut skipped);
    }
    Ok((merge(&sets), warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lines(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("Line{}()", i)).collect()
    }

    #[test]
    fn island_scenario() {
        let (set, warnings) = parse_patch_text("mod.patch", "ISLAND\n  120\tnull\n  120\tNewLine()\n");
        assert!(warnings.is_empty());

        let mut original = lines(130);
        original[119] = "OldLine()".to_string();
        let patched = apply(&original, &set, "ISLAND");

        assert_eq!(patched.len(), 130);
        assert_eq!(patched[119], "NewLine()");
        assert!(!patched.contains(&"OldLine()".to_string()));
        assert_eq!(patched[118], original[118]);
        assert_eq!(patched[120], original[120]);
    }

    #[test]
    fn map_names_are_normalised() {
        assert_eq!(map_key("field/ISLAND.map"), "island");
        assert_eq!(map_key("C:\\maps\\Castle.MAP"), "castle");
        assert_eq!(map_key("island"), "island");

        let (set, _) = parse_patch_text("p", "maps/Island.map\n\t3\tWait(1)\n");
        assert!(set.has_map("ISLAND"));
        assert_eq!(set.map_names().collect::<Vec<_>>(), vec!["island"]);
    }

    #[test]
    fn empty_text_is_an_insertion() {
        let (set, _) = parse_patch_text("p", "castle\n  2\t\n");
        let patched = apply(&lines(3), &set, "castle");
        assert_eq!(patched, vec!["Line1()", "Line2()", "", "Line3()"]);
    }

    #[test]
    fn malformed_lines_are_warned_and_skipped() {
        let text = "  4\torphan\ncastle\n  four\tx\n  0\tx\n  5 no tab\n  1\tok\n";
        let (set, warnings) = parse_patch_text("bad.patch", text);
        let positions: Vec<usize> = warnings.iter().map(|w| w.line).collect();
        assert_eq!(positions, vec![1, 3, 4, 5]);
        assert_eq!(warnings[0].source, "bad.patch");
        assert_eq!(
            set.edits("castle").unwrap().get(&1),
            Some(&vec![PatchEntry::Insert("ok".to_string())])
        );
    }

    #[test]
    fn deletion_is_promoted_and_never_doubled() {
        let (a, _) = parse_patch_text("a", "m\n  2\tFirst()\n");
        let (b, _) = parse_patch_text("b", "m\n  2\tnull\n  2\tSecond()\n");
        let (c, _) = parse_patch_text("c", "m\n  2\tnull\n");

        let merged = merge(&[a, b, c]);
        assert_eq!(
            merged.edits("m").unwrap()[&2],
            vec![
                PatchEntry::Delete,
                PatchEntry::Insert("First()".to_string()),
                PatchEntry::Insert("Second()".to_string()),
            ]
        );
        assert_eq!(
            apply(&lines(3), &merged, "m"),
            vec!["Line1()", "First()", "Second()", "Line3()"]
        );
    }

    #[test]
    fn merge_is_associative_over_the_source_order() {
        let (a, _) = parse_patch_text("a", "m\n  1\tA()\n  3\tnull\n");
        let (b, _) = parse_patch_text("b", "m\n  1\tnull\nn\n  2\tB()\n");
        let (c, _) = parse_patch_text("c", "m\n  1\tC()\n  3\tC()\n");

        let stepwise = merge(&[merge(&[a.clone(), b.clone()]), c.clone()]);
        assert_eq!(stepwise, merge(&[a, b, c]));
    }

    #[test]
    fn apply_reads_only_the_original_text() {
        let (set, _) = parse_patch_text("a", "m\n  1\tnull\n  1\tFirst()\n  2\tExtra()\n");
        let original = lines(3);
        let expected = vec!["First()", "Line2()", "Extra()", "Line3()"];

        let once = apply(&original, &set, "m");
        assert_eq!(once, expected);
        // The pipeline always starts again from the disassembled original,
        // so a second run reproduces the first instead of growing it.
        assert_eq!(apply(&original, &set, "m"), once);
        // Feeding the output back in is a different input and does compound.
        assert_eq!(
            apply(&once, &set, "m"),
            vec!["First()", "Line2()", "Extra()", "Extra()", "Line3()"]
        );
        assert_eq!(apply(&original, &set, "other"), original);
    }

    #[test]
    fn repeated_source_repeats_its_insertions() {
        let (a, _) = parse_patch_text("a", "m\n  1\tnull\n  1\tFirst()\n  2\tExtra()\n");
        let merged = merge(&[a.clone(), a]);
        let edits = merged.edits("m").unwrap();
        assert_eq!(
            edits[&1],
            vec![
                PatchEntry::Delete,
                PatchEntry::Insert("First()".to_string()),
                PatchEntry::Insert("First()".to_string()),
            ]
        );
        assert_eq!(
            edits[&2],
            vec![
                PatchEntry::Insert("Extra()".to_string()),
                PatchEntry::Insert("Extra()".to_string()),
            ]
        );
    }

    #[test]
    fn loads_directories_and_archives_in_order() {
        let root = std::env::temp_dir().join(format!("mapscript-patch-{}", std::process::id()));
        let dir = root.join("mods");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("b.patch"), "m\n  1\tFromB()\n").unwrap();
        fs::write(dir.join("a.patch"), "m\n  1\tFromA()\n").unwrap();
        fs::write(dir.join("readme.txt"), "not a patch").unwrap();

        let zip_path = root.join("mod.zip");
        let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
        writer
            .start_file("patches/z.patch", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"m\n  1\tFromZip()\n").unwrap();
        writer.finish().unwrap();

        let (set, warnings) = load_patch_sources(&[dir.clone(), zip_path.clone()]).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(
            set.edits("m").unwrap()[&1],
            vec![
                PatchEntry::Insert("FromA()".to_string()),
                PatchEntry::Insert("FromB()".to_string()),
                PatchEntry::Insert("FromZip()".to_string()),
            ]
        );

        fs::remove_dir_all(&root).unwrap();
    }
}
