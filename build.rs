use std::fs;
use std::path::{Path, PathBuf};

// The estimator is a pure library: no file access, terminal output or text parsing.
const FORBIDDEN: &[&str] = &["std::fs", "File::open", "println!", "eprintln!", "read_to_string("];

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");

    let mut sources = Vec::new();
    collect_sources(Path::new("src"), &mut sources);

    let violations: Vec<String> = sources
        .iter()
        .filter_map(|path| fs::read_to_string(path).ok().map(|text| (path, text)))
        .flat_map(|(path, text)| {
            text.lines()
                .enumerate()
                .flat_map(|(idx, line)| {
                    FORBIDDEN
                        .iter()
                        .filter(move |token| line.contains(**token))
                        .map(move |token| format!("{}:{}: `{token}`", path.display(), idx + 1))
                })
                .collect::<Vec<_>>()
        })
        .collect();

    if !violations.is_empty() {
        panic!(
            "src/ must stay free of I/O and printing:\n  {}",
            violations.join("\n  ")
        );
    }
}

fn collect_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            collect_sources(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            out.push(path);
        }
    }
}
