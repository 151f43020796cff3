//! End-to-end tests for the stargal binary

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn write_corpus(dir: &Path) {
    fs::create_dir_all(dir.join("cutouts")).unwrap();
    let mut manifest = String::from("path,label\n");
    for i in 0..8 {
        for (token, peak) in [("star", 300.0), ("galaxy", 40.0)] {
            let rows: Vec<String> = (0..20)
                .map(|r| {
                    (0..20)
                        .map(|c| {
                            let d2 = ((r as f64 - 9.5).powi(2) + (c as f64 - 9.5).powi(2)) / 10.0;
                            format!("{}", 1.0 + i as f64 + peak * (-d2).exp())
                        })
                        .collect::<Vec<_>>()
                        .join(" ")
                })
                .collect();
            let name = format!("cutouts/{token}{i}.txt");
            fs::write(dir.join(&name), rows.join("\n")).unwrap();
            manifest.push_str(&format!("{name},{token}\n"));
        }
    }
    fs::write(dir.join("labels.csv"), manifest).unwrap();
    fs::write(dir.join("empty.toml"), "").unwrap();
}

fn stargal(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stargal"))
        .current_dir(dir)
        .arg("--config")
        .arg("empty.toml")
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn test_normalize_evaluate_report() {
    let temp = TempDir::new().unwrap();
    write_corpus(temp.path());

    let out = stargal(temp.path(), &["normalize", "--manifest", "labels.csv", "--out", "tables"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    for file in ["raw.csv", "t1.csv", "t5.csv", "manifest.json"] {
        assert!(temp.path().join("tables").join(file).exists(), "{file}");
    }

    let out = stargal(
        temp.path(),
        &[
            "evaluate", "--tables", "tables", "--technique", "t2", "--technique", "raw",
            "--ratios", "0.25,0.5", "--repeats", "2", "--nn", "3", "--seed", "9", "--json",
            "series.json",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Mean accuracy"));
    assert!(stdout.contains("Class balance"));

    let series: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join("series.json")).unwrap())
            .unwrap();
    assert_eq!(series["t2"].as_array().unwrap().len(), 2);
    assert_eq!(series["raw"][0]["expected"], 2);

    let log = fs::read_to_string(temp.path().join("tables/trials.csv")).unwrap();
    // header plus 2 techniques x 2 ratios x 2 repeats
    assert_eq!(log.lines().count(), 9);

    assert!(temp.path().join("tables/trials.grid.json").exists());

    let out = stargal(temp.path(), &["report", "--tables", "tables"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("t2"));
    assert!(!stdout.contains("not run"));

    // asking for more repeats than were run discloses the shortfall
    let out = stargal(temp.path(), &["report", "--tables", "tables", "--repeats", "3"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("2 of 3 trials completed, 1 not run"));

    let out = stargal(
        temp.path(),
        &["inspect", "--tables", "tables", "--technique", "t3", "--rows", "2", "--json"],
    );
    assert!(out.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);
}

#[test]
fn test_normalize_discards_trial_log() {
    let temp = TempDir::new().unwrap();
    write_corpus(temp.path());
    let evaluate = [
        "evaluate", "--tables", "tables", "--technique", "raw", "--ratios", "0.5", "--repeats",
        "2", "--nn", "3", "--seed", "4",
    ];

    let out = stargal(temp.path(), &["normalize", "--manifest", "labels.csv", "--out", "tables"]);
    assert!(out.status.success());
    let out = stargal(temp.path(), &evaluate);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let log = temp.path().join("tables/trials.csv");
    let sorted_lines = |path: &Path| {
        let mut lines: Vec<String> =
            fs::read_to_string(path).unwrap().lines().map(String::from).collect();
        lines.sort();
        lines
    };
    let first = sorted_lines(&log);
    assert_eq!(first.len(), 3);

    // same seed, same tables: every logged trial is reused
    let out = stargal(temp.path(), &evaluate);
    assert!(out.status.success());
    assert_eq!(sorted_lines(&log), first);

    let out = stargal(temp.path(), &["normalize", "--manifest", "labels.csv", "--out", "tables"]);
    assert!(out.status.success());
    assert!(!log.exists());
    assert!(!temp.path().join("tables/trials.grid.json").exists());
}

#[test]
fn test_missing_corpus_fails() {
    let temp = TempDir::new().unwrap();
    write_corpus(temp.path());
    let out = stargal(temp.path(), &["normalize", "--manifest", "nope.csv"]);
    assert!(!out.status.success());
}
