use clap::Parser;
use std::path::PathBuf;

use mapscript_core::{dump_map, roundtrip_map, run, CompilerSettings, SymbolCatalog};

#[derive(Debug, Parser)]
#[command(
    name = "mapscript",
    version,
    about = "Disassemble, patch and reassemble map-script containers"
)]
struct Args {
    /// JSON settings file; replaces the path flags below.
    #[arg(long, value_name = "JSON")]
    config: Option<PathBuf>,

    #[arg(long, required_unless_present = "config")]
    definitions: Option<PathBuf>,

    #[arg(long, required_unless_present_any = ["config", "dump_map", "roundtrip_map"])]
    input: Option<PathBuf>,

    #[arg(long, required_unless_present_any = ["config", "dump_map", "roundtrip_map"])]
    output: Option<PathBuf>,

    #[arg(long, default_value = "map")]
    map_extension: String,

    /// Patch file, directory of *.patch files or .zip mod archive.
    /// Repeat in priority order.
    #[arg(long = "patch", value_name = "PATH")]
    patches: Vec<PathBuf>,

    #[arg(long, default_value_t = false)]
    recompile_all: bool,

    #[arg(long, default_value_t = false)]
    dump_text: bool,

    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Debug-only: print the disassembly of one container and exit.
    #[arg(long, value_name = "MAP", hide = true)]
    dump_map: Option<PathBuf>,

    /// Debug-only: reassemble one container's disassembly and report
    /// whether the bytes are identical.
    #[arg(long, value_name = "MAP", hide = true)]
    roundtrip_map: Option<PathBuf>,
}

fn settings_from_args(args: &Args) -> Result<CompilerSettings, String> {
    if let Some(path) = args.config.as_ref() {
        return CompilerSettings::from_json_file(path)
            .map_err(|e| format!("Failed to load {:?}: {}", path, e));
    }

    let missing = |flag: &str| format!("--{} is required without --config", flag);
    Ok(CompilerSettings {
        definitions_path: args.definitions.clone().ok_or_else(|| missing("definitions"))?,
        input_path: args.input.clone().ok_or_else(|| missing("input"))?,
        output_path: args.output.clone().ok_or_else(|| missing("output"))?,
        map_extension: args.map_extension.clone(),
        patch_sources: args.patches.clone(),
        recompile_all: args.recompile_all,
        dump_text: args.dump_text,
        debug: args.debug,
    })
}

fn load_catalog(args: &Args) -> SymbolCatalog {
    let definitions = match (&args.definitions, &args.config) {
        (Some(dir), _) => dir.clone(),
        (None, Some(config)) => match CompilerSettings::from_json_file(config) {
            Ok(settings) => settings.definitions_path,
            Err(e) => {
                eprintln!("Failed to load {:?}: {}", config, e);
                std::process::exit(1);
            }
        },
        (None, None) => {
            eprintln!("--definitions is required");
            std::process::exit(1);
        }
    };

    match SymbolCatalog::load(&definitions) {
        Ok(catalog) => catalog,
        Err(e) => {
            eprintln!("Failed to load definitions from {:?}: {}", definitions, e);
            std::process::exit(1);
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // Debug paths: inspect a single container and exit.
    if let Some(map_path) = args.dump_map.as_ref() {
        let catalog = load_catalog(&args);
        match dump_map(&catalog, map_path) {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
            }
            Err(e) => {
                eprintln!("Failed to disassemble {:?}: {}", map_path, e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Some(map_path) = args.roundtrip_map.as_ref() {
        let catalog = load_catalog(&args);
        match roundtrip_map(&catalog, map_path) {
            Ok(true) => println!("{:?}: identical", map_path),
            Ok(false) => {
                println!("{:?}: bytes differ after reassembly", map_path);
                std::process::exit(2);
            }
            Err(e) => {
                eprintln!("Failed to round-trip {:?}: {}", map_path, e);
                std::process::exit(1);
            }
        }
        return;
    }

    let settings = match settings_from_args(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match run(settings) {
        Ok(summary) => {
            log::info!("{:?}", summary);
            println!(
                "{} written, {} copied, {} failed, {} patch line(s) skipped",
                summary.written, summary.copied, summary.failed, summary.patch_warnings
            );
        }
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}
