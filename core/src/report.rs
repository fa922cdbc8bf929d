use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_REPORT_TEMPLATE: &str = r"# Experiment Notebook

<!-- SECTION:overview start -->
<!-- Describe the dataset folds and the classification target of this run. -->
<!-- SECTION:overview end -->

## Configuration

<!-- SECTION:configuration start -->
<!-- Populated automatically with the hyperparameters and channel means of the latest run. -->
<!-- SECTION:configuration end -->

## Evaluation

<!-- SECTION:metrics start -->
<!-- Populated automatically with the evaluation history and best accuracy. -->
<!-- SECTION:metrics end -->

## Predictions

<!-- SECTION:samples-primary start -->
<!-- Held-out faces with their true and predicted classes. -->
<!-- SECTION:samples-primary end -->

<!-- SECTION:samples-secondary start -->
<!-- Training faces with their true and predicted classes. -->
<!-- SECTION:samples-secondary end -->

> Keep the `<!-- SECTION:name start/end -->` markers around regions that are rewritten after each run.
";

/// Replacement body for the region between a pair of section markers.
#[derive(Clone, Debug)]
pub struct ReportSection {
    id: String,
    body: String,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }

    fn marker(&self, edge: &str) -> String {
        format!("<!-- SECTION:{} {edge} -->", self.id)
    }
}

/// Write `template` to `path` unless a notebook already exists there.
pub fn ensure_report_file(path: &Path, template: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create notebook directory {}", dir.display()))?;
    }
    fs::write(path, template)
        .with_context(|| format!("failed to write notebook template {}", path.display()))
}

/// Rewrite each section of the notebook at `path`, leaving everything outside the markers intact.
pub fn update_sections(path: &Path, sections: &[ReportSection]) -> Result<()> {
    let original = fs::read_to_string(path)
        .with_context(|| format!("failed to read notebook {}", path.display()))?;
    let updated = sections
        .iter()
        .try_fold(original, |content, section| replace_section(&content, section))?;

    fs::write(path, updated).with_context(|| format!("failed to update notebook {}", path.display()))
}

/// Render a markdown table; rows shorter than the header are padded with blanks.
pub fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut output = String::new();
    output.push_str(&format!("| {} |\n", headers.join(" | ")));
    output.push_str(&format!("|{}\n", " --- |".repeat(headers.len())));

    for row in rows {
        let cells: Vec<&str> = (0..headers.len())
            .map(|i| row.get(i).map(String::as_str).unwrap_or(""))
            .collect();
        output.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    output
}

fn replace_section(content: &str, section: &ReportSection) -> Result<String> {
    let open = section.marker("start");
    let close = section.marker("end");

    let (before, rest) = content
        .split_once(&open)
        .ok_or_else(|| anyhow!("missing start marker: {open}"))?;
    let (_, after) = rest
        .split_once(&close)
        .ok_or_else(|| anyhow!("missing end marker: {close}"))?;

    let body = section.body.trim_matches('\n');
    let mut updated = format!("{before}{open}\n");
    if !body.is_empty() {
        updated.push_str(body);
        updated.push('\n');
    }
    updated.push_str(&close);
    updated.push_str(after);
    Ok(updated)
}
