use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use rai_draft::template::{extract_input_text, output_path};
use rai_draft::{TemplateDocument, UnitLayout};
use tempfile::tempdir;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

const STYLES: &[u8] = br#"<?xml version="1.0"?><w:styles xmlns:w="urn:w"><w:style w:styleId="Heading1"/></w:styles>"#;

fn docx(body: &str) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.start_file("[Content_Types].xml", options).unwrap();
    writer.write_all(b"<Types/>").unwrap();
    writer.start_file("word/document.xml", options).unwrap();
    writer
        .write_all(
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="urn:w"><w:body>{body}<w:sectPr/></w:body></w:document>"#
            )
            .as_bytes(),
        )
        .unwrap();
    writer.start_file("word/styles.xml", options).unwrap();
    writer.write_all(STYLES).unwrap();
    writer.finish().unwrap().into_inner()
}

fn para(text: &str) -> String {
    format!("<w:p><w:r><w:t>{text}</w:t></w:r></w:p>")
}

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn layout() -> UnitLayout {
    UnitLayout {
        marker_prefix: "Intended use #".into(),
        stop_marker: "Section 3: Adverse Impact".into(),
    }
}

/// Cover page, five per-unit blocks, then the adverse impact section.
fn assessment_template(extra_unit3: &str, tail: &str) -> Vec<u8> {
    let mut body = para("Solution: ##SOLUTION_DESCRIPTION");
    for k in 1..=5 {
        body.push_str(&para(&format!("Intended use #{k}: ##INTENDED_USE_0{k}")));
        body.push_str(&para(&format!("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU0{k}")));
        if k == 3 {
            body.push_str(extra_unit3);
        }
    }
    body.push_str(&para("Section 3: Adverse Impact"));
    body.push_str(tail);
    docx(&body)
}

fn two_unit_map() -> BTreeMap<String, String> {
    let mut values = map(&[
        ("##SOLUTION_DESCRIPTION", "Claims triage assistant"),
        ("##INTENDED_USE_01", "Triage claims"),
        ("##INTENDED_USE_02", "Flag fraud"),
        ("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU01", "Fits"),
        ("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU02", "Mostly fits"),
    ]);
    for k in 3..=5 {
        values.insert(format!("##INTENDED_USE_0{k}"), String::new());
        values.insert(format!("##ASSESSMENT_OF_FITNESS_FOR_PURPOSE_IU0{k}"), String::new());
    }
    values
}

fn part_bytes(docx: &[u8], name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(Cursor::new(docx)).unwrap();
    let mut file = archive.by_name(name).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn rendering_is_byte_identical_across_runs() {
    let template = assessment_template("", "");
    let values = two_unit_map();

    let render = || {
        let mut doc = TemplateDocument::from_bytes(&template).unwrap();
        doc.render(&values, 2, Some(&layout())).unwrap();
        doc.to_bytes().unwrap()
    };

    assert_eq!(render(), render());
}

#[test]
fn untouched_parts_are_carried_verbatim() {
    let template = assessment_template("", "");
    let mut doc = TemplateDocument::from_bytes(&template).unwrap();
    doc.render(&two_unit_map(), 2, Some(&layout())).unwrap();
    let out = doc.to_bytes().unwrap();

    assert_eq!(part_bytes(&out, "word/styles.xml"), STYLES);
    assert_eq!(part_bytes(&out, "[Content_Types].xml"), b"<Types/>");
}

#[test]
fn placeholder_split_across_runs_is_replaced() {
    let body = concat!(
        "<w:p>",
        "<w:r><w:rPr><w:b/></w:rPr><w:t>Use: ##INTEN</w:t></w:r>",
        "<w:r><w:t>DED_USE_01</w:t></w:r>",
        "<w:r><w:t> (primary)</w:t></w:r>",
        "</w:p>"
    );
    let mut doc = TemplateDocument::from_bytes(&docx(body)).unwrap();
    let report = doc
        .render(&map(&[("##INTENDED_USE_01", "Triage claims")]), 1, None)
        .unwrap();

    assert_eq!(report.replace.replaced, 1);
    assert_eq!(report.replace.rebuilt_paragraphs, 1);
    assert_eq!(doc.text().unwrap(), "Use: Triage claims (primary)");
}

#[test]
fn missing_placeholder_stays_literal_and_is_reported() {
    let body = para("Owner: ##SOLUTION_OWNER, uses: ##INTENDED_USE_01");
    let mut doc = TemplateDocument::from_bytes(&docx(&body)).unwrap();
    let report = doc
        .render(&map(&[("##INTENDED_USE_01", "Triage")]), 1, None)
        .unwrap();

    assert_eq!(doc.text().unwrap(), "Owner: ##SOLUTION_OWNER, uses: Triage");
    assert!(report.unresolved().contains("##SOLUTION_OWNER"));
    assert_eq!(report.unresolved().len(), 1);
}

#[test]
fn longest_token_wins_over_its_prefix() {
    let body = para("##INTENDED_USE_1 / ##INTENDED_USE_10");
    let mut doc = TemplateDocument::from_bytes(&docx(&body)).unwrap();
    doc.render(
        &map(&[("##INTENDED_USE_1", "one"), ("##INTENDED_USE_10", "ten")]),
        0,
        None,
    )
    .unwrap();

    assert_eq!(doc.text().unwrap(), "one / ten");
}

#[test]
fn unpopulated_units_are_pruned() {
    let template = assessment_template("", &para("Closing notes"));
    let mut doc = TemplateDocument::from_bytes(&template).unwrap();
    let report = doc.render(&two_unit_map(), 2, Some(&layout())).unwrap();

    assert_eq!(report.prune.units_found, 5);
    assert_eq!(report.prune.removed_units, vec![3, 4, 5]);
    assert!(report.prune.protected_units.is_empty());

    let text = doc.text().unwrap();
    assert!(text.contains("Intended use #1: Triage claims"));
    assert!(text.contains("Intended use #2: Flag fraud"));
    assert!(text.contains("Mostly fits"));
    assert!(!text.contains("Intended use #3"));
    assert!(!text.contains("Intended use #5"));
    assert!(text.contains("Section 3: Adverse Impact"));
    assert!(text.contains("Closing notes"));
}

#[test]
fn unit_sharing_a_placeholder_with_retained_content_is_kept() {
    let template = assessment_template(
        &para("Shared reviewer: ##REVIEWER"),
        &para("Signed off by ##REVIEWER"),
    );
    let mut doc = TemplateDocument::from_bytes(&template).unwrap();
    let report = doc.render(&two_unit_map(), 2, Some(&layout())).unwrap();

    assert_eq!(report.prune.removed_units, vec![4, 5]);
    assert_eq!(report.prune.protected_units, vec![3]);
    assert!(doc.text().unwrap().contains("Intended use #3"));
}

#[test]
fn all_units_populated_removes_nothing() {
    let template = assessment_template("", "");
    let mut doc = TemplateDocument::from_bytes(&template).unwrap();
    let report = doc.render(&map(&[]), 5, Some(&layout())).unwrap();
    assert!(report.prune.removed_units.is_empty());
    assert!(doc.text().unwrap().contains("Intended use #5"));
}

#[test]
fn saved_variant_reloads_with_replacements() {
    let dir = tempdir().unwrap();
    let template_path = dir.path().join("public.docx");
    std::fs::write(&template_path, assessment_template("", "")).unwrap();

    let mut doc = TemplateDocument::load(&template_path).unwrap();
    doc.render(&two_unit_map(), 2, Some(&layout())).unwrap();
    let out = output_path(&dir.path().join("output"), "run-42", "public");
    doc.save(&out).unwrap();

    assert!(out.ends_with("output/run-42_public.docx"));
    let text = extract_input_text(&out).unwrap();
    assert!(text.starts_with("Solution: Claims triage assistant"));
}

#[test]
fn extract_input_text_reads_plain_text_files() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("solution.txt");
    std::fs::write(&path, "A claims triage assistant.\n").unwrap();
    assert_eq!(
        extract_input_text(&path).unwrap(),
        "A claims triage assistant.\n"
    );
}
