//! Build script for spinor-firmware
//!
//! - Sets up linker search paths for memory.x
//! - Validates flash_layout.toml at compile time
//! - Emits the validated layout as constants into OUT_DIR

use std::env;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// RP2040 erase block size
const BLOCK_SIZE: i64 = 4096;

/// QSPI part size on the supported boards
const FLASH_SIZE: i64 = 2 * 1024 * 1024;

/// Sectors per erase block
const SECTORS_PER_BLOCK: i64 = 8;

fn main() {
    setup_linker();
    let layout = validate_layout();
    write_layout(&layout);
}

/// Set up linker search paths for memory.x
fn setup_linker() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Copy memory.x to the output directory
    let memory_x = include_bytes!("memory.x");
    let mut f = File::create(out_dir.join("memory.x")).unwrap();
    f.write_all(memory_x).unwrap();

    // Tell rustc where to find memory.x
    println!("cargo:rustc-link-search={}", out_dir.display());

    // Re-run if memory.x changes
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=build.rs");
}

/// Validated values from flash_layout.toml
struct FlashLayout {
    firmware_start: i64,
    firmware_len: i64,
    metadata_sectors: i64,
    protected_blocks: i64,
    reserved_blocks: i64,
    reserved_index: i64,
    verify_tail: bool,
}

/// Validate flash_layout.toml at compile time
fn validate_layout() -> FlashLayout {
    println!("cargo:rerun-if-changed=flash_layout.toml");

    let layout_path = Path::new("flash_layout.toml");

    if !layout_path.exists() {
        panic!(
            "\n\
            ╔══════════════════════════════════════════════════════════════════╗\n\
            ║  ERROR: flash_layout.toml not found!                             ║\n\
            ║                                                                  ║\n\
            ║  The firmware requires a flash layout description.               ║\n\
            ║  Please create one in the spinor-firmware directory.             ║\n\
            ╚══════════════════════════════════════════════════════════════════╝\n"
        );
    }

    let content = match fs::read_to_string(layout_path) {
        Ok(content) => content,
        Err(e) => {
            panic!(
                "\n\
                ╔══════════════════════════════════════════════════════════════════╗\n\
                ║  ERROR: Failed to read flash_layout.toml                         ║\n\
                ║                                                                  ║\n\
                ║  Error: {:<56} ║\n\
                ╚══════════════════════════════════════════════════════════════════╝\n",
                e
            );
        }
    };

    let config: toml::Value = match toml::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            let error_msg = e.to_string();
            panic!(
                "\n\
                ╔══════════════════════════════════════════════════════════════════╗\n\
                ║  ERROR: Invalid TOML syntax in flash_layout.toml                 ║\n\
                ╠══════════════════════════════════════════════════════════════════╣\n\
                ║                                                                  ║\n\
                {}\n\
                ║                                                                  ║\n\
                ╚══════════════════════════════════════════════════════════════════╝\n",
                format_error_lines(&error_msg)
            );
        }
    };

    let mut errors = Vec::new();

    let firmware_start = integer(&config, "firmware", "start", &mut errors);
    let firmware_len = integer(&config, "firmware", "len", &mut errors);
    let metadata_sectors = integer(&config, "translator", "metadata_sectors", &mut errors);
    let protected_blocks = integer(&config, "translator", "protected_blocks", &mut errors);
    let reserved_blocks = integer(&config, "translator", "reserved_blocks", &mut errors);
    let reserved_index = integer(&config, "params", "reserved_index", &mut errors);
    let verify_tail = match config.get("params").and_then(|p| p.get("verify_tail")) {
        Some(toml::Value::Boolean(b)) => *b,
        Some(_) => {
            errors.push("[params] verify_tail must be a boolean".to_string());
            false
        }
        None => false,
    };

    if firmware_start % BLOCK_SIZE != 0 {
        errors.push(format!("[firmware] start must be a multiple of {}", BLOCK_SIZE));
    }
    if firmware_len <= 0 || firmware_start + firmware_len > FLASH_SIZE {
        errors.push("[firmware] image must be non-empty and fit in 2 MiB".to_string());
    }
    if metadata_sectors > SECTORS_PER_BLOCK {
        errors.push(format!(
            "[translator] metadata_sectors must be 0-{}",
            SECTORS_PER_BLOCK
        ));
    }
    if protected_blocks > 255 {
        errors.push("[translator] protected_blocks must be 0-255".to_string());
    }
    if reserved_blocks < 1 {
        errors.push("[translator] reserved_blocks must hold the parameter block".to_string());
    }
    if reserved_index >= reserved_blocks {
        errors.push("[params] reserved_index must be below reserved_blocks".to_string());
    }

    if !errors.is_empty() {
        panic!(
            "\n\
            ╔══════════════════════════════════════════════════════════════════╗\n\
            ║  ERROR: Invalid flash layout                                     ║\n\
            ╠══════════════════════════════════════════════════════════════════╣\n\
            {}\n\
            ╚══════════════════════════════════════════════════════════════════╝\n",
            errors
                .iter()
                .map(|e| format!("║  • {:<62} ║", e))
                .collect::<Vec<_>>()
                .join("\n")
        );
    }

    println!("cargo:warning=flash_layout.toml validated successfully");

    FlashLayout {
        firmware_start,
        firmware_len,
        metadata_sectors,
        protected_blocks,
        reserved_blocks,
        reserved_index,
        verify_tail,
    }
}

/// Look up a non-negative integer in `[section] key`
fn integer(config: &toml::Value, section: &str, key: &str, errors: &mut Vec<String>) -> i64 {
    match config.get(section).and_then(|s| s.get(key)) {
        Some(toml::Value::Integer(v)) if *v >= 0 => *v,
        Some(_) => {
            errors.push(format!("[{}] {} must be a non-negative integer", section, key));
            0
        }
        None => {
            errors.push(format!("[{}] missing '{}'", section, key));
            0
        }
    }
}

/// Format error message lines with box drawing
fn format_error_lines(msg: &str) -> String {
    msg.lines()
        .map(|line| {
            let truncated = if line.len() > 64 {
                format!("{}...", &line[..61])
            } else {
                line.to_string()
            };
            format!("║  {:<64} ║", truncated)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Emit the layout constants included by main.rs
fn write_layout(layout: &FlashLayout) {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let mut f = File::create(out_dir.join("flash_layout.rs")).unwrap();
    writeln!(f, "pub const FIRMWARE_START: u32 = {};", layout.firmware_start).unwrap();
    writeln!(f, "pub const FIRMWARE_LEN: u32 = {};", layout.firmware_len).unwrap();
    writeln!(f, "pub const METADATA_SECTORS: u32 = {};", layout.metadata_sectors).unwrap();
    writeln!(f, "pub const PROTECTED_BLOCKS: u32 = {};", layout.protected_blocks).unwrap();
    writeln!(f, "pub const RESERVED_BLOCKS: u32 = {};", layout.reserved_blocks).unwrap();
    writeln!(f, "pub const PARAM_RESERVED_INDEX: u32 = {};", layout.reserved_index).unwrap();
    writeln!(f, "pub const VERIFY_TAIL: bool = {};", layout.verify_tail).unwrap();
}
