//! ctxpack CLI integration tests.
//!
//! ## Exit Codes
//! - 0: Success
//! - 1: Validation or gate failure
//! - 2: Schema error, hash mismatch, or a warning under `--fail-on-warn`
//! - 3: BUDGET_ERROR

use std::fs;
use std::path::Path;

use anyhow::Result;
use ctxpack_core::builder::build_pack_value;
use ctxpack_core::hash::sha256_hex;
use predicates::prelude::*;
use serde_json::{Value, json};
use tempfile::TempDir;

/// A ctxpack command running in `cwd`, isolated from user configuration.
fn ctxpack(cwd: &Path) -> Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("ctxpack")?;
    cmd.current_dir(cwd)
        .env("XDG_CONFIG_HOME", cwd.join(".config"))
        .env("HOME", cwd)
        .env_remove("RUST_LOG")
        .env_remove("CTXPACK_GATE__MODE")
        .env_remove("CTXPACK_ASSEMBLE__DEFAULT_MODEL")
        .env_remove("CTXPACK_ASSEMBLE__DETERMINISM_CHECK")
        .env_remove("CTXPACK_VALIDATE__ALLOW_MINOR_VERSION");
    Ok(cmd)
}

fn write_json(dir: &Path, name: &str, value: &Value) -> Result<()> {
    fs::write(dir.join(name), serde_json::to_string_pretty(value)?)?;
    Ok(())
}

fn draft() -> Value {
    json!({
        "sections": [
            {"name": "templates", "items": [
                {"path": "templates/A.txt", "content": "SAME"},
                {"path": "templates/B.txt", "content": "other template"}
            ]},
            {"name": "linked_tests", "items": [{"path": "tests/B.txt", "content": "SAME"}]}
        ]
    })
}

fn sealed_pack() -> Result<Value> {
    Ok(build_pack_value(draft())?.to_value()?)
}

#[test]
fn assemble_writes_a_manifest() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "draft.json", "--out", "manifest.json"])
        .assert()
        .success();

    let manifest: Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("manifest.json"))?)?;
    assert_eq!(manifest["model"], "m");
    assert_eq!(manifest["totals"]["files"], 2);
    assert_eq!(manifest["pointers"][0]["to_id"], "templates/A.txt");
    assert_eq!(manifest["hash"].as_str().map(str::len), Some(64));
    Ok(())
}

#[test]
fn assemble_to_stdout_is_stable() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;

    let run = |dir: &Path| -> Result<Vec<u8>> {
        Ok(ctxpack(dir)?
            .args(["assemble", "--model", "m", "--in", "draft.json"])
            .output()?
            .stdout)
    };
    let first = run(dir.path())?;
    assert!(!first.is_empty());
    assert_eq!(first, run(dir.path())?);
    Ok(())
}

#[test]
fn assemble_dry_run_writes_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;

    ctxpack(dir.path())?
        .args([
            "assemble", "--model", "m", "--in", "draft.json", "--out", "manifest.json", "--dry-run",
            "--report", "report.json",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"totals\""));

    assert!(!dir.path().join("manifest.json").exists());
    let report: Value = serde_json::from_str(&fs::read_to_string(dir.path().join("report.json"))?)?;
    assert_eq!(report["metrics"]["deduped"], 1);
    assert_eq!(report["warnings"], json!([]));
    Ok(())
}

#[test]
fn unknown_draft_field_exits_2() -> Result<()> {
    let dir = TempDir::new()?;
    let mut bad = draft();
    bad["bogus"] = json!(true);
    write_json(dir.path(), "draft.json", &bad)?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "draft.json"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("SCHEMA_INVALID"));
    Ok(())
}

#[test]
fn unplaceable_required_item_exits_3() -> Result<()> {
    let dir = TempDir::new()?;
    let content = "required content that cannot fit in a single token";
    let draft = json!({
        "sections": [{"name": "diff_slices", "items": [{"path": "src/req.ts", "content": content}]}],
        "must_include": [{
            "kind": "file",
            "section": "diff_slices",
            "loc": {"path": "src/req.ts", "start_line": 1},
            "sha256": sha256_hex(content),
            "source": "diff"
        }]
    });
    write_json(dir.path(), "draft.json", &draft)?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "draft.json", "--budget.max_tokens", "1"])
        .assert()
        .code(3)
        .stderr(
            predicate::str::contains("BUDGET_ERROR").and(predicate::str::contains("src/req.ts")),
        );
    Ok(())
}

#[test]
fn eviction_warning_fails_under_fail_on_warn() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "draft.json", "--section.cap", "templates=0,1"])
        .assert()
        .success()
        .stderr(predicate::str::contains("evicted templates/templates/B.txt"));

    ctxpack(dir.path())?
        .args([
            "assemble", "--model", "m", "--in", "draft.json", "--section.cap", "templates=0,1",
            "--fail-on-warn",
        ])
        .assert()
        .code(2);
    Ok(())
}

#[test]
fn sealed_pack_assembles_as_written() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;
    write_json(dir.path(), "pack.json", &sealed_pack()?)?;

    let run = |input: &str| -> Result<Vec<u8>> {
        Ok(ctxpack(dir.path())?
            .args(["assemble", "--model", "m", "--in", input])
            .output()?
            .stdout)
    };
    assert_eq!(run("pack.json")?, run("draft.json")?);
    Ok(())
}

#[test]
fn tampered_sealed_pack_exits_2() -> Result<()> {
    let dir = TempDir::new()?;
    let mut pack = sealed_pack()?;
    pack["budgets"]["max_tokens"] = json!(1);
    write_json(dir.path(), "pack.json", &pack)?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "pack.json"])
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("HASH_MISMATCH"));
    Ok(())
}

#[test]
fn budget_flags_cannot_change_a_sealed_pack() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "pack.json", &sealed_pack()?)?;

    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "pack.json", "--budget.max_files", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("SCHEMA_INVALID /budgets"));
    Ok(())
}

#[test]
fn model_can_come_from_config_file() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "draft.json", &draft())?;

    ctxpack(dir.path())?
        .args(["assemble", "--in", "draft.json"])
        .assert()
        .code(2);

    fs::write(dir.path().join("ctxpack.toml"), "[assemble]\ndefault_model = \"from-config\"\n")?;
    ctxpack(dir.path())?
        .args(["assemble", "--in", "draft.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("from-config"));
    Ok(())
}

#[test]
fn validate_and_hash_a_sealed_pack() -> Result<()> {
    let dir = TempDir::new()?;
    let pack = sealed_pack()?;
    write_json(dir.path(), "pack.json", &pack)?;

    ctxpack(dir.path())?.args(["validate", "pack.json"]).assert().success();

    let hash = pack["hash"].as_str().unwrap_or_default().to_string();
    ctxpack(dir.path())?
        .args(["hash", "pack.json"])
        .assert()
        .success()
        .stdout(format!("{hash}\n"));
    Ok(())
}

#[test]
fn validate_rejects_tampered_and_malformed_packs() -> Result<()> {
    let dir = TempDir::new()?;
    let mut pack = sealed_pack()?;
    pack["budgets"]["max_files"] = json!(1);
    write_json(dir.path(), "tampered.json", &pack)?;

    ctxpack(dir.path())?
        .args(["validate", "tampered.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HASH_MISMATCH"));

    let mut bad = sealed_pack()?;
    bad["order"] = json!(["extras", "templates"]);
    write_json(dir.path(), "bad.json", &bad)?;
    ctxpack(dir.path())?
        .args(["validate", "bad.json"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("INVALID_ORDER"));
    Ok(())
}

#[test]
fn print_emits_canonical_json() -> Result<()> {
    let dir = TempDir::new()?;
    fs::write(dir.path().join("doc.json"), "{ \"b\": 1,\n  \"a\": [true, null] }")?;

    ctxpack(dir.path())?
        .args(["print", "doc.json"])
        .assert()
        .success()
        .stdout("{\"a\":[true,null],\"b\":1}\n");
    Ok(())
}

#[test]
fn gate_modes_on_a_corrupted_hash() -> Result<()> {
    let dir = TempDir::new()?;
    let mut pack = sealed_pack()?;
    pack["hash"] = json!("0".repeat(64));
    write_json(dir.path(), "pack.json", &pack)?;

    ctxpack(dir.path())?
        .args(["gate", "pack.json", "--mode", "warn"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("HASH_MISMATCH"));

    ctxpack(dir.path())?
        .args(["gate", "pack.json", "--mode", "enforce"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HASH_MISMATCH"));
    Ok(())
}

#[test]
fn gate_passes_a_clean_pack() -> Result<()> {
    let dir = TempDir::new()?;
    write_json(dir.path(), "pack.json", &sealed_pack()?)?;

    ctxpack(dir.path())?
        .args(["gate", "pack.json", "--mode", "enforce"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\": true"));
    Ok(())
}

#[test]
fn plan_output_validates() -> Result<()> {
    let dir = TempDir::new()?;
    let signals = json!({
        "labels": ["api"],
        "diff": "--- a/src/a.ts\n+++ b/src/a.ts\n@@ -1 +1 @@\n+export function a() {}\n",
        "file_contents": {"src/a.ts": "export function a() {}\n"}
    });
    write_json(dir.path(), "signals.json", &signals)?;

    ctxpack(dir.path())?
        .args(["plan", "--signals", "signals.json", "--out", "pack.json"])
        .assert()
        .success();
    ctxpack(dir.path())?.args(["validate", "pack.json"]).assert().success();
    ctxpack(dir.path())?
        .args(["assemble", "--model", "m", "--in", "pack.json", "--dry-run"])
        .assert()
        .success();
    Ok(())
}
