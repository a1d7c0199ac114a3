//! Composes the system instruction from the persona prompt and knowledge base.

use crate::types::KnowledgeFile;

const KNOWLEDGE_HEADER: &str =
    "--- KNOWLEDGE BASE ---\nThe following files were provided as reference material.";

/// Append every knowledge file, in upload order, to the configured instruction.
///
/// With no files the instruction is returned unchanged.
pub fn compose_system_instruction(instruction: &str, files: &[KnowledgeFile]) -> String {
    if files.is_empty() {
        return instruction.to_string();
    }

    let blocks: Vec<String> = files
        .iter()
        .map(|f| format!("=== FILE: {} ===\n{}\n=== END FILE ===", f.name, f.content))
        .collect();

    format!("{instruction}\n\n{KNOWLEDGE_HEADER}\n\n{}", blocks.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_files_leaves_instruction_untouched() {
        let instruction = "You are Sophie, a concierge.";
        assert_eq!(compose_system_instruction(instruction, &[]), instruction);
    }

    #[test]
    fn test_files_serialized_in_upload_order() {
        let files = vec![
            KnowledgeFile::new("pricing.txt", "Basic: $10\nPro: $30"),
            KnowledgeFile::new("faq.txt", "Q: Refunds?\nA: Within 30 days."),
        ];
        let out = compose_system_instruction("Be concise.", &files);

        let expected = "Be concise.\n\n\
            --- KNOWLEDGE BASE ---\n\
            The following files were provided as reference material.\n\n\
            === FILE: pricing.txt ===\nBasic: $10\nPro: $30\n=== END FILE ===\n\n\
            === FILE: faq.txt ===\nQ: Refunds?\nA: Within 30 days.\n=== END FILE ===";
        assert_eq!(out, expected);

        let pricing = out.find("pricing.txt").unwrap();
        let faq = out.find("faq.txt").unwrap();
        assert!(pricing < faq);
    }

    #[test]
    fn test_composition_is_deterministic() {
        let files = vec![KnowledgeFile::new("a.txt", "x")];
        assert_eq!(
            compose_system_instruction("p", &files),
            compose_system_instruction("p", &files)
        );
    }
}
