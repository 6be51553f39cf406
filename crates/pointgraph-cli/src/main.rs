//! # Pointgraph CLI
//!
//! Offline maintenance of a pointgraph SQLite database.

use anyhow::{Context, Result};
use pointgraph_core::hash::hex;
use pointgraph_core::HashMode;
use pointgraph_server::{Dump, SqliteStore, Store, VerifyReport};
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "verify" | "maint" => {
            let store = open(db_arg(&args, &args[1])?)?;
            let report = store.verify(true, args[1] == "maint")?;
            print_report(&report);
            if !report.mismatches.is_empty() && !report.repaired {
                std::process::exit(2);
            }
        }
        "dump" => {
            let store = open(db_arg(&args, "dump")?)?;
            let json = serde_json::to_string_pretty(&store.dump())?;
            match args.get(3) {
                Some(file) => {
                    std::fs::write(file, json).with_context(|| format!("Failed to write {file}"))?;
                }
                None => println!("{json}"),
            }
        }
        "import" => {
            let Some(file) = args.get(3) else {
                eprintln!("Usage: pointgraph import <db> <dump.json>");
                std::process::exit(1);
            };
            let store = open(db_arg(&args, "import")?)?;
            let json =
                std::fs::read_to_string(file).with_context(|| format!("Failed to read {file}"))?;
            let dump: Dump = serde_json::from_str(&json).context("Invalid dump file")?;
            let report = store.import(dump)?;
            let stats = store.stats();
            println!("imported: {} nodes, {} edges", stats.nodes, stats.edges);
            print_report(&report);
        }
        "root" => {
            let store = open(db_arg(&args, "root")?)?;
            match store.root_id() {
                Some(root) => println!("{root}"),
                None => {
                    eprintln!("Store has no root");
                    std::process::exit(1);
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn db_arg<'a>(args: &'a [String], cmd: &str) -> Result<&'a Path> {
    match args.get(2) {
        Some(db) => Ok(Path::new(db)),
        None => anyhow::bail!("Usage: pointgraph {cmd} <db>"),
    }
}

fn open(path: &Path) -> Result<Store> {
    let hash_mode = match env::var("POINTGRAPH_HASH_MODE") {
        Ok(mode) => mode
            .parse()
            .map_err(anyhow::Error::msg)
            .context("Invalid POINTGRAPH_HASH_MODE")?,
        Err(_) => HashMode::default(),
    };
    let db = SqliteStore::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Store::open(Box::new(db), hash_mode).context("Failed to load store")
}

fn print_report(report: &VerifyReport) {
    println!("checked: {} edges", report.checked);
    for m in &report.mismatches {
        println!(
            "mismatch: edge {} ({} -> {}) stored {} computed {}",
            m.edge_id,
            m.up,
            m.down,
            hex(&m.stored),
            hex(&m.computed)
        );
    }
    if report.repaired {
        println!("repaired: {} edges", report.mismatches.len());
    }
}

fn print_help() {
    println!(
        r#"Pointgraph CLI

USAGE:
    pointgraph <COMMAND> <DB> [ARGS]

COMMANDS:
    verify <db>               Check edge hashes below the root, exit 2 on mismatch
    maint <db>                Check edge hashes below the root and repair them
    dump <db> [file]          Write the store as JSON to a file or stdout
    import <db> <file>        Merge a JSON dump into the store
    root <db>                 Print the root node ID
    help                      Show this help message

ENVIRONMENT:
    POINTGRAPH_HASH_MODE      "timestamps" (default) or "values"

EXAMPLES:
    pointgraph verify ./pointgraph.db
    pointgraph dump ./pointgraph.db backup.json
"#
    );
}
