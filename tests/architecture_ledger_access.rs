use std::fs;
use std::path::{Path, PathBuf};

/// Only the engine may mutate the ledger; everything else goes through it.
const ALLOWED_LEDGER_MUTATORS: &[&str] = &["src/engine/executor.rs", "src/ledger/book.rs"];

const LEDGER_MUTATIONS: &[&str] = &[".apply_fill(", ".close_with_status(", ".mark_symbol(", ".mark_price("];

fn collect_rust_files(root: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rust_files(&path, out);
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) == Some("rs") {
            out.push(path);
        }
    }
}

#[test]
fn ledger_mutations_are_limited_to_the_engine() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let mut files = Vec::new();
    collect_rust_files(&repo_root.join("src"), &mut files);

    let mut offenders = Vec::new();
    for file in files {
        let rel = file
            .strip_prefix(repo_root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if ALLOWED_LEDGER_MUTATORS.iter().any(|allowed| *allowed == rel) {
            continue;
        }
        let content = fs::read_to_string(&file).unwrap_or_default();
        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("//") {
                continue;
            }
            if LEDGER_MUTATIONS.iter().any(|call| trimmed.contains(call)) {
                offenders.push(format!("{rel}:{}: {trimmed}", idx + 1));
            }
        }
    }

    assert!(
        offenders.is_empty(),
        "ledger mutated outside the engine:\n{}",
        offenders.join("\n")
    );
}

#[test]
fn background_tasks_do_not_reach_into_engine_state() {
    let repo_root = Path::new(env!("CARGO_MANIFEST_DIR"));
    for rel in ["src/market/cache.rs", "src/ledger/stats.rs"] {
        let content = fs::read_to_string(repo_root.join(rel)).unwrap_or_default();
        assert!(!content.is_empty(), "{rel} should exist");
        assert!(
            !content.contains("crate::engine"),
            "{rel} must not depend on the engine"
        );
    }
}
