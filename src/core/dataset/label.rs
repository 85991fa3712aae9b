use std::fs;
use std::path::Path;

use crate::core::taxonomy::ClassMapping;
use crate::error::{PipelineError, PipelineResult};

/// One YOLO annotation line: a class id followed by opaque geometry tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelLine {
    pub class_id: u32,
    pub geometry: String,
}

impl LabelLine {
    pub fn render(&self) -> String {
        if self.geometry.is_empty() {
            self.class_id.to_string()
        } else {
            format!("{} {}", self.class_id, self.geometry)
        }
    }
}

/// Parse a label line.
///
/// Returns `None` for blank lines and lines without a leading non-negative
/// integer. Geometry tokens are kept as text so they pass through unchanged.
pub fn parse_label_line(line: &str) -> Option<LabelLine> {
    let mut tokens = line.split_whitespace();
    let class_id = tokens.next()?.parse::<u32>().ok()?;
    let geometry = tokens.collect::<Vec<_>>().join(" ");
    Some(LabelLine { class_id, geometry })
}

/// Leading class id of a label line, if any
pub fn leading_class_id(line: &str) -> Option<u32> {
    line.split_whitespace().next()?.parse::<u32>().ok()
}

/// Result of remapping one label file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapOutcome {
    pub lines: Vec<LabelLine>,
    /// Input lines whose class has no target
    pub dropped: usize,
    /// Non-blank lines without a parseable class id
    pub malformed: usize,
}

impl RemapOutcome {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(LabelLine::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Rewrite label text into the target taxonomy, one output line per mapped id.
pub fn remap_label_text(content: &str, mapping: &ClassMapping) -> RemapOutcome {
    let mut outcome = RemapOutcome::default();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some(parsed) = parse_label_line(line) else {
            outcome.malformed += 1;
            continue;
        };

        let targets = mapping.targets(parsed.class_id);
        if targets.is_empty() {
            outcome.dropped += 1;
            continue;
        }
        for &target in targets {
            outcome.lines.push(LabelLine {
                class_id: target,
                geometry: parsed.geometry.clone(),
            });
        }
    }

    outcome
}

/// Remap `src` into `dst`. Nothing is written when no line survives.
pub fn remap_label_file(
    src: &Path,
    dst: &Path,
    mapping: &ClassMapping,
) -> PipelineResult<RemapOutcome> {
    let content = fs::read_to_string(src).map_err(|e| PipelineError::unreadable(src, e))?;
    let outcome = remap_label_text(&content, mapping);

    if !outcome.is_empty() {
        fs::write(dst, outcome.render()).map_err(|e| PipelineError::output(dst, e))?;
    }

    Ok(outcome)
}
