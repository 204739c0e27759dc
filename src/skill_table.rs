//! Static mapping from observed skill ids to class specializations.
//!
//! Rules are checked top to bottom; the first spec owning any of the
//! attacker's observed skill ids wins, and each spec pins its class id.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecRule {
    pub class_id: u32,
    pub class_name: &'static str,
    pub spec_name: &'static str,
    pub skill_ids: &'static [u32],
}

pub const SPEC_RULES: &[SpecRule] = &[
    SpecRule { class_id: 1, class_name: "Stormblade", spec_name: "Iaido", skill_ids: &[1714, 1734] },
    SpecRule { class_id: 1, class_name: "Stormblade", spec_name: "Moonstrike", skill_ids: &[44701, 179906] },
    SpecRule { class_id: 2, class_name: "Frost Mage", spec_name: "Icicle", skill_ids: &[120901, 120902] },
    SpecRule { class_id: 2, class_name: "Frost Mage", spec_name: "Frostbeam", skill_ids: &[1241] },
    SpecRule { class_id: 4, class_name: "Wind Knight", spec_name: "Vanguard", skill_ids: &[1405, 1418] },
    SpecRule { class_id: 4, class_name: "Wind Knight", spec_name: "Skyward", skill_ids: &[1419] },
    SpecRule { class_id: 5, class_name: "Verdant Oracle", spec_name: "Smite", skill_ids: &[1518, 1541, 21402] },
    SpecRule { class_id: 5, class_name: "Verdant Oracle", spec_name: "Lifebind", skill_ids: &[20301] },
    SpecRule { class_id: 9, class_name: "Heavy Guardian", spec_name: "Earthfort", skill_ids: &[199902] },
    SpecRule { class_id: 9, class_name: "Heavy Guardian", spec_name: "Block", skill_ids: &[1930, 1931, 1934, 1935] },
    SpecRule { class_id: 11, class_name: "Marksman", spec_name: "Falconry", skill_ids: &[220112, 2203622] },
    SpecRule { class_id: 11, class_name: "Marksman", spec_name: "Wildpack", skill_ids: &[2292, 1700820, 1700825, 1700827] },
    SpecRule { class_id: 12, class_name: "Shield Knight", spec_name: "Recovery", skill_ids: &[2405] },
    SpecRule { class_id: 12, class_name: "Shield Knight", spec_name: "Shield", skill_ids: &[2406] },
    SpecRule { class_id: 13, class_name: "Beat Performer", spec_name: "Dissonance", skill_ids: &[2306] },
    SpecRule { class_id: 13, class_name: "Beat Performer", spec_name: "Concerto", skill_ids: &[2307, 2361, 55302] },
];

/// First rule (in table order) owning any of the observed skill ids.
pub fn detect_spec(observed: &HashSet<u32>) -> Option<&'static SpecRule> {
    SPEC_RULES
        .iter()
        .find(|rule| rule.skill_ids.iter().any(|id| observed.contains(id)))
}

pub fn class_name(class_id: u32) -> Option<&'static str> {
    SPEC_RULES
        .iter()
        .find(|rule| rule.class_id == class_id)
        .map(|rule| rule.class_name)
}
