//! Specialty-aware prompt construction for narrative synthesis.
//!
//! Keeps prompting consistent across specialties; the generated prompt is
//! also what gets embedded for retrieval, so both stages see the same
//! framing.

const PROMPT_BASE: &str =
    "Answer the clinical question concisely and cite supporting evidence from similar cases.";

const SPECIALTY_INSTRUCTIONS: &[(&str, &str)] = &[
    (
        "infectious",
        "Prioritize microbiology, travel history, febrile patterns, and platelet trends.",
    ),
    (
        "cardiology",
        "Prioritize chest pain characteristics, ECGs, troponin trends, and hemodynamics.",
    ),
    (
        "radiology",
        "Describe imaging findings, modality-specific sensitivity, and differential diagnoses.",
    ),
];

const GENERAL_INSTRUCTIONS: &str =
    "Provide practical next steps, red flags, and conservative management when uncertain.";

/// Build the synthesis prompt for a query, falling back to the general
/// instructions for unknown or absent specialties.
#[must_use]
pub fn build_specialty_prompt(query: &str, specialty: Option<&str>) -> String {
    let lowered = specialty.map(str::to_lowercase);
    let instructions = lowered
        .as_deref()
        .and_then(|name| {
            SPECIALTY_INSTRUCTIONS
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, text)| *text)
        })
        .unwrap_or(GENERAL_INSTRUCTIONS);
    format!("{PROMPT_BASE} Question: {query}\nSpecialty instructions: {instructions}")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TPRM-001
    #[test]
    fn prompt_carries_specialty_instructions() {
        let prompt = build_specialty_prompt("persistent fever after travel", Some("infectious"));
        assert!(prompt.contains("persistent fever after travel"));
        assert!(prompt.contains("travel history"));
    }

    // Test IDs: TPRM-002
    #[test]
    fn prompt_specialty_lookup_is_case_insensitive() {
        let upper = build_specialty_prompt("chest pain", Some("Cardiology"));
        let lower = build_specialty_prompt("chest pain", Some("cardiology"));
        assert_eq!(upper, lower);
        assert!(upper.contains("troponin"));
    }

    // Test IDs: TPRM-003
    #[test]
    fn prompt_falls_back_to_general_instructions() {
        let unknown = build_specialty_prompt("rash", Some("dermatology"));
        let absent = build_specialty_prompt("rash", None);
        assert!(unknown.contains("conservative management"));
        assert!(absent.contains("conservative management"));
    }
}
