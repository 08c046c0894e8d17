//! The single place a backend prompt is assembled. Adapters never build
//! their own.

use crate::api::TaskType;

pub(crate) struct PromptInput<'a> {
    pub(crate) task_type: TaskType,
    pub(crate) language: Option<&'a str>,
    pub(crate) file_path: Option<&'a str>,
    /// Instruction after pattern-memory rewriting.
    pub(crate) instruction: &'a str,
    pub(crate) context: Option<&'a str>,
}

pub(crate) fn render(input: &PromptInput<'_>) -> String {
    let mut out = String::with_capacity(
        64 + input.instruction.len() + input.context.map(str::len).unwrap_or(0),
    );

    out.push_str("Task: ");
    out.push_str(input.task_type.as_str());
    out.push('\n');
    if let Some(language) = input.language {
        out.push_str("Language: ");
        out.push_str(language);
        out.push('\n');
    }
    if let Some(file_path) = input.file_path {
        out.push_str("File: ");
        out.push_str(file_path);
        out.push('\n');
    }

    out.push_str("\nInstruction:\n");
    out.push_str(input.instruction);
    out.push('\n');

    if let Some(context) = input.context {
        out.push_str("\nContext:\n");
        out.push_str(context);
        out.push('\n');
    }

    out.push_str("\nReturn only the final answer, with no preamble or commentary.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_sections_in_order() {
        let prompt = render(&PromptInput {
            task_type: TaskType::Review,
            language: Some("rust"),
            file_path: Some("src/lib.rs"),
            instruction: "check error handling",
            context: Some("fn main() {}"),
        });

        let task = prompt.find("Task: review").unwrap();
        let lang = prompt.find("Language: rust").unwrap();
        let file = prompt.find("File: src/lib.rs").unwrap();
        let instr = prompt.find("Instruction:\ncheck error handling").unwrap();
        let ctx = prompt.find("Context:\nfn main() {}").unwrap();
        assert!(task < lang && lang < file && file < instr && instr < ctx);
        assert!(prompt.ends_with("Return only the final answer, with no preamble or commentary.\n"));
    }

    #[test]
    fn omits_absent_optional_sections() {
        let prompt = render(&PromptInput {
            task_type: TaskType::Generate,
            language: None,
            file_path: None,
            instruction: "hello",
            context: None,
        });
        assert!(!prompt.contains("Language:"));
        assert!(!prompt.contains("File:"));
        assert!(!prompt.contains("Context:"));
    }
}
