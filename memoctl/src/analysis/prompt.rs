//! Prompts sent to the generative model.

use super::planner::FileDescriptor;

fn language_clause(language: Option<&str>) -> String {
    match language {
        Some(language) => format!("Write every value in {language}."),
        None => "Write every value in the language the documents are written in.".to_string(),
    }
}

/// Instruction for one batch: one flat JSON member per file, keyed by the file's display name.
pub fn batch_prompt(files: &[FileDescriptor], language: Option<&str>) -> String {
    let names = files.iter().map(|f| format!("- {}", f.display_name())).collect::<Vec<_>>().join("\n");
    format!(
        r#"You are given {count} document(s). Extract every attribute you can identify from each one.

Return a single JSON object and nothing else. It must have one member per document, keyed by the
file name exactly as listed below. Each member is a flat object of attribute name to value.
Name nested attributes by joining the levels with "-", for example "vendor-address-city".
All values must be strings. {language}

Documents, in the order they are attached:
{names}

Example:
{{
  "receipt.jpg": {{ "vendor-name": "ACME", "total-amount": "12000", "date": "2024-03-01" }}
}}"#,
        count = files.len(),
        language = language_clause(language),
    )
}

/// Instruction for summarising a note and giving advice about it.
pub fn advice_prompt(title: &str, body: &str, file_names: &[&str], language: Option<&str>) -> String {
    let sources = if file_names.is_empty() { "body" } else { "body and attached files" };
    let attachments = if file_names.is_empty() {
        String::new()
    } else {
        format!("\nAttached files: {}", file_names.join(", "))
    };
    format!(
        r#"Summarise the topic of the note below and give advice about it, based on its {sources}.
Return only a JSON object with exactly two string members:
- "subject": a short, clear summary of the topic
- "advice": concrete, natural advice drawn from the {sources}
{language}

Title: "{title}"
Body: "{body}"{attachments}

Example:
{{
  "subject": "Industry classification of two companies",
  "advice": "The first company develops software; the second works in e-commerce and advertising."
}}"#,
        language = language_clause(language),
    )
}
