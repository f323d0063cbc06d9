//! Prompt construction for the extraction generator.

use std::fmt::Write;

use crate::extract::ExtractHints;

/// Build the default extraction prompt: asks for a bare JSON array of
/// `{content, subject, category}` records, shaped by the caller's hints.
pub fn extraction_prompt(text: &str, hints: &ExtractHints) -> String {
    let mut b = String::new();
    b.push_str(
        "Extract factual claims from the following text. Return a JSON array of objects, each with these fields:\n",
    );
    b.push_str("- \"content\": the factual claim as a concise sentence\n");
    b.push_str("- \"subject\": the primary entity being described\n");
    b.push_str(
        "- \"category\": one of: preference, identity, project, capability, world, relationship, note\n\n",
    );

    if !hints.persona.is_empty() {
        let _ = writeln!(b, "Context: you are extracting facts for the persona {:?}.", hints.persona);
    }
    if !hints.focus.is_empty() {
        let _ = writeln!(b, "Prioritize facts about: {}.", hints.focus.join(", "));
    }
    if !hints.categories.is_empty() {
        let _ = writeln!(b, "Only extract facts in these categories: {}.", hints.categories.join(", "));
    }

    b.push_str("\nReturn ONLY the JSON array, no other text.\n\nText:\n");
    b.push_str(text);
    b
}
