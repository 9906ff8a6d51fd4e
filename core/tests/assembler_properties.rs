//! Behavioral properties of the assembler over built packs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use ctxpack_core::assemble::{AssembleOptions, ELISION_MARKER, assemble, assemble_value};
use ctxpack_core::builder::build_pack_value;
use ctxpack_core::gate::{GateMode, GateOptions, gate};
use ctxpack_core::hash::{seal_hash_value, sha256_hex, verify, verify_value};
use ctxpack_core::manifest::EvictionReason;
use ctxpack_core::types::{Pack, SectionName};
use ctxpack_core::{ErrorCode, Manifest};
use pretty_assertions::assert_eq;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::{Value, json};

fn build(draft: Value) -> Pack {
    build_pack_value(draft).expect("draft should build")
}

fn run(pack: &Pack) -> Manifest {
    assemble(pack, &AssembleOptions::new("test-model")).expect("assembly should succeed")
}

fn section_ids(manifest: &Manifest, name: SectionName) -> Vec<String> {
    manifest
        .section(name)
        .map(|s| s.items.iter().map(|i| i.id.clone()).collect())
        .unwrap_or_default()
}

fn mixed_draft() -> Value {
    json!({
        "budgets": {"max_tokens": 200, "max_files": 8, "max_per_file_tokens": 40},
        "sections": [
            {"name": "diff_slices", "items": [
                {"path": "src/b.ts", "symbol": "g", "loc": {"path": "src/b.ts", "start_line": 9}, "content": "function g() { return 2; }"},
                {"path": "src/a.ts", "symbol": "f", "loc": {"path": "src/a.ts", "start_line": 1}, "content": "function f() { return 1; }"},
                {"path": "src/c.ts", "content": "c".repeat(400)}
            ]},
            {"name": "templates", "items": [
                {"path": "templates/api.md", "content": "API rules"},
                {"path": "templates/generic.md", "content": "General rules"}
            ]},
            {"name": "extras", "items": [
                {"path": "src/util.ts", "content": "API rules", "distance_to_diff": 1},
                {"path": "src/z.ts", "spans": [{"text": "one"}, {"text": "two"}], "distance_to_diff": 1}
            ]},
            {"name": "linked_tests", "items": [
                {"path": "tests/a.test.ts", "content": "test('f', () => {})"}
            ]}
        ]
    })
}

#[test]
fn assembly_is_idempotent() {
    let pack = build(mixed_draft());
    let first = run(&pack);
    let second = run(&pack);
    assert_eq!(first.hash, second.hash);
    assert_eq!(
        serde_json::to_string(&first).expect("serialize"),
        serde_json::to_string(&second).expect("serialize")
    );
    verify(&first).expect("manifest seal should verify");
}

#[test]
fn shuffled_sections_give_the_same_manifest() {
    let baseline = run(&build(mixed_draft()));

    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draft = mixed_draft();
        let sections = draft["sections"].as_array_mut().expect("sections array");
        sections.shuffle(&mut rng);
        for section in sections.iter_mut() {
            section["items"]
                .as_array_mut()
                .expect("items array")
                .shuffle(&mut rng);
        }
        let manifest = run(&build(draft));
        assert_eq!(manifest.item_ids(), baseline.item_ids(), "seed {seed}");
        assert_eq!(manifest.hash, baseline.hash, "seed {seed}");
    }
}

#[test]
fn canonical_order_within_sections() {
    let manifest = run(&build(mixed_draft()));
    assert_eq!(
        section_ids(&manifest, SectionName::DiffSlices),
        vec!["src/a.ts#f", "src/b.ts#g", "src/c.ts"]
    );
    let names: Vec<SectionName> = manifest.sections.iter().map(|s| s.name).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

#[test]
fn oversized_items_are_compressed_to_the_per_file_cap() {
    let manifest = run(&build(mixed_draft()));
    let section = manifest
        .section(SectionName::DiffSlices)
        .expect("diff slices present");
    let big = section
        .items
        .iter()
        .find(|i| i.id == "src/c.ts")
        .expect("compressed item kept");
    assert!(big.tokens <= 40);
    let text = big.text.as_deref().expect("text");
    assert!(text.contains(ELISION_MARKER));
    assert!(text.starts_with('c') && text.ends_with('c'));
}

#[test]
fn spans_are_merged_and_counted() {
    let manifest = run(&build(mixed_draft()));
    let extras = manifest.section(SectionName::Extras).expect("extras");
    let merged = extras
        .items
        .iter()
        .find(|i| i.id == "src/z.ts")
        .expect("span item kept");
    assert_eq!(merged.text.as_deref(), Some("one\ntwo"));
    assert_eq!(manifest.metrics.merged_spans, 1);
}

#[test]
fn caps_hold_for_many_budgets() {
    let mut rng = StdRng::seed_from_u64(7);
    let cases = [(0, 0, 1), (30, 3, 2), (5, 10, 10), (1000, 2, 0), (60, 0, 3)];
    for (max_tokens, max_files, cap) in cases {
        let mut draft = mixed_draft();
        draft["budgets"] = json!({
            "max_tokens": max_tokens,
            "max_files": max_files,
            "max_per_file_tokens": 20,
            "section_caps": {
                "templates": cap, "spec_canvas": cap, "diff_slices": cap,
                "linked_tests": cap, "contracts": cap, "extras": cap
            }
        });
        draft["sections"]
            .as_array_mut()
            .expect("sections")
            .shuffle(&mut rng);
        let manifest = run(&build(draft));

        if max_files > 0 {
            assert!(manifest.totals.files <= max_files);
        }
        if max_tokens > 0 {
            assert!(manifest.totals.tokens <= max_tokens);
        }
        for section in &manifest.sections {
            let placed = section.items.iter().filter(|i| !i.is_pointer()).count() as u64;
            assert!(placed <= cap, "{} placed {placed} > {cap}", section.name);
            for item in &section.items {
                assert!(item.tokens <= 20);
                if item.is_pointer() {
                    assert_eq!(item.tokens, 0);
                }
            }
            assert_eq!(manifest.metrics.per_section[&section.name].files, placed);
        }
        let summed: u64 = manifest
            .sections
            .iter()
            .flat_map(|s| s.items.iter())
            .map(|i| i.tokens)
            .sum();
        assert_eq!(summed, manifest.totals.tokens);
    }
}

#[test]
fn duplicate_content_becomes_a_pointer() {
    let pack = build(json!({
        "sections": [
            {"name": "templates", "items": [{"path": "templates/A.txt", "content": "SAME"}]},
            {"name": "linked_tests", "items": [{"path": "linked_tests/B.txt", "content": "SAME"}]}
        ]
    }));
    let manifest = run(&pack);

    let templates = manifest.section(SectionName::Templates).expect("templates");
    assert_eq!(templates.items.len(), 1);
    assert!(!templates.items[0].is_pointer());

    let tests = manifest.section(SectionName::LinkedTests).expect("linked tests");
    assert_eq!(tests.items.len(), 1);
    let pointer = &tests.items[0];
    assert!(pointer.is_pointer());
    assert_eq!(pointer.tokens, 0);
    assert_eq!(pointer.text, None);
    let reference = pointer.reference.as_ref().expect("pointer ref");
    assert_eq!(reference.section, SectionName::Templates);
    assert_eq!(reference.id, "templates/A.txt");

    assert_eq!(manifest.pointers.len(), 1);
    assert_eq!(manifest.pointers[0].from_id, "linked_tests/B.txt");
    assert_eq!(manifest.pointers[0].to_id, "templates/A.txt");
    assert_eq!(manifest.metrics.deduped, 1);
    assert_eq!(manifest.totals.files, 1);
}

#[test]
fn duplicate_of_an_evicted_item_is_evicted() {
    let pack = build(json!({
        "budgets": {"section_caps": {"templates": 0}},
        "sections": [
            {"name": "templates", "items": [{"path": "t.md", "content": "SAME"}]},
            {"name": "extras", "items": [{"path": "e.md", "content": "SAME"}]}
        ]
    }));
    let manifest = run(&pack);
    assert!(manifest.pointers.is_empty());
    let reasons: Vec<(String, EvictionReason)> = manifest
        .evictions
        .iter()
        .map(|e| (e.id.clone(), e.reason))
        .collect();
    assert_eq!(
        reasons,
        vec![
            ("t.md".to_string(), EvictionReason::SectionCap),
            ("e.md".to_string(), EvictionReason::DuplicateOfEvicted),
        ]
    );
}

#[test]
fn eviction_prefers_closer_then_shorter() {
    let pack = build(json!({
        "budgets": {"section_caps": {"templates": 2}},
        "sections": [{"name": "templates", "items": [
            {"path": "far.txt", "content": "far away", "distance_to_diff": 100},
            {"path": "near_long.txt", "content": "near and rather long content", "distance_to_diff": 1},
            {"path": "near_short.txt", "content": "near", "distance_to_diff": 1}
        ]}]
    }));
    let manifest = run(&pack);
    assert_eq!(
        section_ids(&manifest, SectionName::Templates),
        vec!["near_long.txt", "near_short.txt"]
    );
    assert_eq!(manifest.evictions.len(), 1);
    assert_eq!(manifest.evictions[0].id, "far.txt");
    assert_eq!(manifest.evictions[0].reason, EvictionReason::SectionCap);
}

#[test]
fn shorter_wins_a_distance_tie() {
    let pack = build(json!({
        "budgets": {"section_caps": {"extras": 1}},
        "sections": [{"name": "extras", "items": [
            {"path": "a_long.txt", "content": "long long long", "distance_to_diff": 2},
            {"path": "b_short.txt", "content": "short", "distance_to_diff": 2}
        ]}]
    }));
    let manifest = run(&pack);
    assert_eq!(section_ids(&manifest, SectionName::Extras), vec!["b_short.txt"]);
}

fn must_locator(section: &str, path: &str, content: &str) -> Value {
    json!({
        "kind": "file",
        "section": section,
        "loc": {"path": path, "start_line": 1},
        "sha256": sha256_hex(content),
        "source": "manual"
    })
}

#[test]
fn unfittable_required_item_is_a_budget_error() {
    let content = "this required slice is far too large for one token";
    let pack = build(json!({
        "budgets": {"max_tokens": 1, "max_files": 0, "max_per_file_tokens": 1},
        "sections": [{"name": "diff_slices", "items": [{"path": "src/req.ts", "content": content}]}],
        "must_include": [must_locator("diff_slices", "src/req.ts", content)]
    }));
    let err = assemble(&pack, &AssembleOptions::new("m")).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::BudgetError);
    assert!(err.to_string().contains("src/req.ts"));
}

#[test]
fn zero_cap_section_with_required_item_fails() {
    let pack = build(json!({
        "budgets": {"section_caps": {"contracts": 0}},
        "sections": [{"name": "contracts", "items": [{"path": "db/1.sql", "content": "x"}]}],
        "must_include": [must_locator("contracts", "db/1.sql", "x")]
    }));
    let err = assemble(&pack, &AssembleOptions::new("m")).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::BudgetError);
}

#[test]
fn unknown_required_locator_fails() {
    let pack = build(json!({
        "must_include": [must_locator("extras", "nowhere.ts", "none")]
    }));
    let err = assemble(&pack, &AssembleOptions::new("m")).expect_err("must fail");
    assert_eq!(err.code(), ErrorCode::BudgetError);
}

#[test]
fn required_items_are_charged_first() {
    let required = "r".repeat(20);
    let pack = build(json!({
        "budgets": {"max_tokens": 10},
        "sections": [
            {"name": "templates", "items": [{"path": "t.md", "content": "t".repeat(32)}]},
            {"name": "extras", "items": [{"path": "need.ts", "content": required}]}
        ],
        "must_include": [must_locator("extras", "need.ts", &required)]
    }));
    let manifest = run(&pack);
    assert_eq!(manifest.item_ids(), vec!["need.ts"]);
    assert_eq!(manifest.evictions[0].reason, EvictionReason::MaxTokens);
}

#[test]
fn required_duplicate_is_satisfied_by_its_pointer() {
    let pack = build(json!({
        "sections": [
            {"name": "templates", "items": [{"path": "a.txt", "content": "SAME"}]},
            {"name": "extras", "items": [{"path": "b.txt", "content": "SAME"}]}
        ],
        "must_include": [{
            "kind": "file",
            "section": "extras",
            "loc": {"path": "b.txt", "start_line": 1},
            "sha256": "0".repeat(64),
            "source": "manual"
        }]
    }));
    let manifest = run(&pack);
    assert_eq!(manifest.pointers.len(), 1);
}

#[test]
fn never_include_removes_before_placement() {
    let pack = build(json!({
        "sections": [
            {"name": "diff_slices", "items": [
                {"path": "src/secret.ts", "loc": {"path": "src/secret.ts", "start_line": 3, "end_line": 8}, "content": "KEY"},
                {"path": "src/open.ts", "content": "open"}
            ]},
            {"name": "extras", "items": [{"path": "src/copy.ts", "content": "KEY"}]}
        ],
        "never_include": [{"path": "src/secret.ts", "start_line": 1, "end_line": 4}]
    }));
    let manifest = run(&pack);
    assert!(!manifest.item_ids().contains(&"src/secret.ts"));
    assert!(manifest.pointers.is_empty());
    assert!(manifest.evictions.iter().all(|e| e.id != "src/secret.ts"));
    // The surviving copy is placed as content, not as a pointer.
    let extras = manifest.section(SectionName::Extras).expect("extras");
    assert_eq!(extras.items[0].text.as_deref(), Some("KEY"));
}

#[test]
fn tampered_pack_is_rejected() {
    let mut pack = build(mixed_draft());
    pack.budgets.max_tokens += 1;
    let err = assemble(&pack, &AssembleOptions::new("m")).expect_err("tampered");
    assert_eq!(err.code(), ErrorCode::HashMismatch);
}

#[test]
fn invalid_pack_is_rejected_before_hashing() {
    let mut pack = build(mixed_draft());
    pack.pr.commit_sha = "abc".into();
    let err = assemble(&pack, &AssembleOptions::new("m")).expect_err("invalid");
    assert_eq!(err.code(), ErrorCode::SchemaInvalid);
}

/// A pack written by hand and sealed over the raw document.
fn hand_sealed(mut doc: Value) -> Value {
    doc["hash"] = json!(seal_hash_value(&doc).expect("hashable"));
    doc
}

fn hand_written_pack() -> Value {
    json!({
        "version": "1.0.0",
        "project": {"id": "proj"},
        "pr": {"id": "7", "branch": "main", "commit_sha": "abcdef1"},
        "mode": "FIX",
        "order": ["templates", "spec_canvas", "diff_slices", "linked_tests", "contracts", "extras"],
        "budgets": {
            "max_tokens": 1000,
            "max_files": 10,
            "max_per_file_tokens": 500,
            "section_caps": {
                "templates": 2, "spec_canvas": 2, "diff_slices": 5,
                "linked_tests": 2, "contracts": 2, "extras": 2
            }
        },
        "sections": [
            {"name": "templates", "items": [{"id": "t", "path": "templates/t.md", "content": "hello"}]}
        ],
        "must_include": [],
        "nice_to_have": [],
        "never_include": [],
        "provenance": []
    })
}

#[test]
fn hand_sealed_pack_assembles_as_written() {
    let raw = hand_sealed(hand_written_pack());
    verify_value(&raw).expect("sealed over the raw document");

    let pack = Pack::from_value(raw.clone()).expect("parses");
    let manifest = run(&pack);
    assert_eq!(section_ids(&manifest, SectionName::Templates), vec!["t"]);

    let again = assemble_value(&raw, &AssembleOptions::new("test-model")).expect("assembles");
    assert_eq!(again.hash, manifest.hash);
}

#[test]
fn omitted_collections_are_rejected_consistently() {
    let mut doc = hand_written_pack();
    doc.as_object_mut().expect("object").remove("must_include");
    let raw = hand_sealed(doc);
    verify_value(&raw).expect("seal itself is fine");

    let err = assemble_value(&raw, &AssembleOptions::new("m")).expect_err("incomplete");
    assert_eq!(err.code(), ErrorCode::MissingRequired);

    let err = gate(&raw, &GateOptions::new(GateMode::Enforce)).expect_err("incomplete");
    assert_eq!(err.code(), ErrorCode::MissingRequired);
}

#[test]
fn raw_tampering_is_caught_before_parsing() {
    let mut raw = hand_sealed(hand_written_pack());
    raw["budgets"]["max_tokens"] = json!(1);
    let err = assemble_value(&raw, &AssembleOptions::new("m")).expect_err("tampered");
    assert_eq!(err.code(), ErrorCode::HashMismatch);
}
