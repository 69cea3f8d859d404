// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use diamondd::{
    filter::spec::{parse_spec_file, serialize_spec_file},
    sig::Signature,
};

use super::load_fixture;

#[test]
fn test_parse_colors_spec() -> Result<()> {
    let text = load_fixture("tests/unit_tests/fixtures/filters/colors.spec")?;
    let filters = parse_spec_file(&text)?;
    assert_eq!(filters.len(), 3);

    let rgb = &filters[0];
    assert_eq!(rgb.name, "f_rgb");
    assert_eq!(rgb.threshold, 1);
    assert_eq!(rgb.merit, 100);
    assert!(rgb.requires.is_empty());

    let red = &filters[1];
    assert_eq!(red.name, "f_has_red");
    assert_eq!(red.eval_function, "f_eval_red");
    assert_eq!(red.args, vec!["0.25"]);
    assert_eq!(red.requires, vec!["f_rgb"]);

    let circle = &filters[2];
    assert_eq!(circle.args, vec!["12", "fine"]);
    Ok(())
}

#[test]
fn test_serialize_parse_idempotent() -> Result<()> {
    let text = load_fixture("tests/unit_tests/fixtures/filters/colors.spec")?;
    let filters = parse_spec_file(&text)?;

    let once = serialize_spec_file(&filters);
    let reparsed = parse_spec_file(&once)?;
    assert_eq!(filters, reparsed);

    let twice = serialize_spec_file(&reparsed);
    assert_eq!(once, twice);
    Ok(())
}

#[test]
fn test_missing_entry_point_rejected() {
    let text = "FILTER broken\nTHRESHOLD 1\nEVAL_FUNCTION f_eval\nINIT_FUNCTION f_init\n";
    assert!(parse_spec_file(text).is_err());
}

#[test]
fn test_unknown_keyword_rejected() {
    let text = "FILTER x\nTHRESHOLD 1\nEVAL_FUNCTION e\nINIT_FUNCTION i\nFINI_FUNCTION f\nBOGUS 3\n";
    assert!(parse_spec_file(text).is_err());
}

#[test]
fn test_keyword_before_filter_rejected() {
    assert!(parse_spec_file("THRESHOLD 5\n").is_err());
}

#[test]
fn test_filter_signature_depends_on_inputs() -> Result<()> {
    let text = load_fixture("tests/unit_tests/fixtures/filters/colors.spec")?;
    let filters = parse_spec_file(&text)?;

    let code = [Signature::of_bytes(b"module-bytes")];
    let base = filters[1].signature(&code);

    // Same spec, same code: same signature.
    assert_eq!(base, parse_spec_file(&text)?[1].signature(&code));

    // Different argument: different signature.
    let mut changed = filters[1].clone();
    changed.args = vec!["0.75".to_string()];
    assert_ne!(base, changed.signature(&code));

    // Different module: different signature.
    assert_ne!(
        base,
        filters[1].signature(&[Signature::of_bytes(b"other-module")])
    );
    Ok(())
}
