use std::collections::BTreeMap;
use tracing::{info, warn};

/// Fixed hierarchical class set of the consolidated dataset.
///
/// The five WBC subtypes always co-occur with `WbcBase` in the output labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetClass {
    RbcNormal,
    RbcSickle,
    Platelets,
    WbcBase,
    Neutrophil,
    Eosinophil,
    Basophil,
    Monocyte,
    Lymphocyte,
}

impl TargetClass {
    pub const ALL: [TargetClass; 9] = [
        TargetClass::RbcNormal,
        TargetClass::RbcSickle,
        TargetClass::Platelets,
        TargetClass::WbcBase,
        TargetClass::Neutrophil,
        TargetClass::Eosinophil,
        TargetClass::Basophil,
        TargetClass::Monocyte,
        TargetClass::Lymphocyte,
    ];

    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetClass::RbcNormal => "RBC_Normal",
            TargetClass::RbcSickle => "RBC_Sickle",
            TargetClass::Platelets => "Platelets",
            TargetClass::WbcBase => "WBC_Base",
            TargetClass::Neutrophil => "Neutrophil",
            TargetClass::Eosinophil => "Eosinophil",
            TargetClass::Basophil => "Basophil",
            TargetClass::Monocyte => "Monocyte",
            TargetClass::Lymphocyte => "Lymphocyte",
        }
    }

    pub fn from_id(id: u32) -> Option<TargetClass> {
        Self::ALL.get(id as usize).copied()
    }
}

/// Canonical class names in id order, as written to data.yaml
pub fn taxonomy_names() -> Vec<String> {
    TargetClass::ALL.iter().map(|c| c.name().to_string()).collect()
}

/// Display name for a class id, falling back to the raw id for foreign classes
pub fn class_label(id: u32) -> String {
    TargetClass::from_id(id)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| format!("class_{}", id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Sickle,
    Platelet,
    WbcSubtype,
    /// Generic leukocyte: parent class only, no subtype signal
    WbcGeneric,
    RbcNormal,
}

struct TaxonomyRule {
    needles: &'static [&'static str],
    targets: &'static [TargetClass],
    kind: RuleKind,
}

impl TaxonomyRule {
    fn matches(&self, lowered: &str) -> bool {
        self.needles.iter().any(|needle| lowered.contains(needle))
    }
}

use TargetClass::*;

// Evaluated top to bottom, first match wins.
const RULES: &[TaxonomyRule] = &[
    TaxonomyRule {
        needles: &["sickle", "elongated", "abnormal", "vertical", "submarine", "ice cube"],
        targets: &[RbcSickle],
        kind: RuleKind::Sickle,
    },
    TaxonomyRule {
        needles: &["platelet"],
        targets: &[Platelets],
        kind: RuleKind::Platelet,
    },
    TaxonomyRule {
        needles: &["neut"],
        targets: &[WbcBase, Neutrophil],
        kind: RuleKind::WbcSubtype,
    },
    TaxonomyRule {
        needles: &["eosi"],
        targets: &[WbcBase, Eosinophil],
        kind: RuleKind::WbcSubtype,
    },
    TaxonomyRule {
        needles: &["baso"],
        targets: &[WbcBase, Basophil],
        kind: RuleKind::WbcSubtype,
    },
    TaxonomyRule {
        needles: &["mono"],
        targets: &[WbcBase, Monocyte],
        kind: RuleKind::WbcSubtype,
    },
    TaxonomyRule {
        needles: &["lymp"],
        targets: &[WbcBase, Lymphocyte],
        kind: RuleKind::WbcSubtype,
    },
    TaxonomyRule {
        needles: &["wbc", "leuko"],
        targets: &[WbcBase],
        kind: RuleKind::WbcGeneric,
    },
    TaxonomyRule {
        needles: &["rbc", "red", "circular", "normal"],
        targets: &[RbcNormal],
        kind: RuleKind::RbcNormal,
    },
];

/// Resolve one raw class name to its target classes (empty when no rule matches).
pub fn classify(raw_name: &str) -> &'static [TargetClass] {
    let lowered = raw_name.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.matches(&lowered))
        .map(|rule| rule.targets)
        .unwrap_or(&[])
}

fn rule_kind(raw_name: &str) -> Option<RuleKind> {
    let lowered = raw_name.to_lowercase();
    RULES.iter().find(|rule| rule.matches(&lowered)).map(|r| r.kind)
}

/// Mapping from a source dataset's local class index to target class ids
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassMapping {
    targets: BTreeMap<u32, Vec<u32>>,
    ignored: Vec<(u32, String)>,
}

impl ClassMapping {
    /// Target ids for a local class id; empty when the class is dropped or unknown.
    pub fn targets(&self, local_id: u32) -> &[u32] {
        self.targets
            .get(&local_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn ignored(&self) -> &[(u32, String)] {
        &self.ignored
    }

    pub fn mapped_count(&self) -> usize {
        self.targets.len()
    }
}

/// Build the class mapping for one source dataset from its declared class names.
pub fn build_class_mapping(dataset_id: &str, raw_names: &[String]) -> ClassMapping {
    info!("Mapping classes for {}: {:?}", dataset_id, raw_names);
    let mut mapping = ClassMapping::default();

    for (index, name) in raw_names.iter().enumerate() {
        let index = index as u32;
        let targets = classify(name);

        if targets.is_empty() {
            warn!("{}: ignoring class {:?} ({})", dataset_id, name, index);
            mapping.ignored.push((index, name.clone()));
            continue;
        }

        let names: Vec<&str> = targets.iter().map(|t| t.name()).collect();
        if rule_kind(name) == Some(RuleKind::WbcGeneric) {
            warn!(
                "{}: {:?} ({}) -> {} only, no subtype",
                dataset_id, name, index, names[0]
            );
        } else {
            info!("{}: {:?} ({}) -> {:?}", dataset_id, name, index, names);
        }

        mapping
            .targets
            .insert(index, targets.iter().map(|t| t.id()).collect());
    }

    mapping
}
