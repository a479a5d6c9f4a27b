//! Contract Parser.
//!
//! Agent contract files are plain text with `# section` headers; each
//! section's body runs until the next header. Unknown sections are ignored
//! rather than rejected, so new sections can be added without breaking
//! older contracts.

use custodian_core::{AgentDefinition, FieldType, OutputField, OutputSchema, PermissionClass};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("{file}: failed to read file: {source}")]
    Read {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{file}: missing required section '{section}'")]
    MissingSection { file: String, section: &'static str },
    #[error("{file}: unknown permission class '{value}'")]
    UnknownPermissionClass { file: String, value: String },
    #[error("{file}: malformed output_schema line '{line}'")]
    MalformedOutputSchema { file: String, line: String },
    #[error("{file}: agent name is empty")]
    EmptyName { file: String },
}

/// Parse one agent contract file into an `AgentDefinition`.
pub fn parse_file(path: &Path) -> Result<AgentDefinition, ContractError> {
    let content = std::fs::read_to_string(path).map_err(|source| ContractError::Read {
        file: path.display().to_string(),
        source,
    })?;
    parse_str(&content, &path.display().to_string())
}

/// Parse contract content already read into memory. Exposed separately so
/// tests and embedders can skip the filesystem.
pub fn parse_str(content: &str, file_label: &str) -> Result<AgentDefinition, ContractError> {
    let sections = split_sections(content);

    let name = sections
        .get("name")
        .map(|s| s.trim())
        .ok_or_else(|| ContractError::MissingSection {
            file: file_label.to_string(),
            section: "name",
        })?
        .to_string();
    if name.is_empty() {
        return Err(ContractError::EmptyName {
            file: file_label.to_string(),
        });
    }

    let permission_class_raw =
        sections
            .get("permission_class")
            .map(|s| s.trim())
            .ok_or_else(|| ContractError::MissingSection {
                file: file_label.to_string(),
                section: "permission_class",
            })?;
    let permission_class = PermissionClass::from_str_loose(permission_class_raw).ok_or_else(|| {
        ContractError::UnknownPermissionClass {
            file: file_label.to_string(),
            value: permission_class_raw.to_string(),
        }
    })?;

    let description = sections
        .get("description")
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ContractError::MissingSection {
            file: file_label.to_string(),
            section: "description",
        })?;

    let prompt_body = sections
        .get("prompt")
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ContractError::MissingSection {
            file: file_label.to_string(),
            section: "prompt",
        })?;

    let input_fields = sections
        .get("input_fields")
        .map(|s| parse_lines(s))
        .unwrap_or_default();

    let output_schema = sections
        .get("output_schema")
        .map(|s| parse_output_schema(s, file_label))
        .transpose()?
        .ok_or_else(|| ContractError::MissingSection {
            file: file_label.to_string(),
            section: "output_schema",
        })?;

    let (default_allowed, default_disallowed) = permission_class.default_write_paths();
    let mut allowed_write_paths = default_allowed;
    let mut disallowed_write_paths = default_disallowed;
    // read-only-scan and planning-synthesis are never allowed to write anywhere,
    // no matter what a contract file declares. A file-declared allow list is
    // only overlaid for classes whose default write surface is non-empty.
    let permits_write_overlay = !matches!(
        permission_class,
        PermissionClass::ReadOnlyScan | PermissionClass::PlanningSynthesis
    );
    if permits_write_overlay {
        if let Some(s) = sections.get("allowed_write_paths") {
            allowed_write_paths.extend(parse_lines(s));
        }
    }
    if let Some(s) = sections.get("disallowed_write_paths") {
        disallowed_write_paths.extend(parse_lines(s));
    }

    Ok(AgentDefinition {
        name,
        permission_class,
        description,
        prompt_body,
        input_fields,
        output_schema,
        allowed_write_paths,
        disallowed_write_paths,
    })
}

/// Split `# section` blocks. A line whose first non-space character is `#`
/// followed by a space starts a new section named by the rest of the line;
/// everything up to the next such line is the section body.
fn split_sections(content: &str) -> HashMap<String, String> {
    let mut sections: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    let mut body = String::new();

    for line in content.lines() {
        if let Some(name) = line.strip_prefix("# ") {
            if let Some(prev) = current.take() {
                sections.insert(prev, std::mem::take(&mut body));
            }
            current = Some(name.trim().to_string());
        } else if current.is_some() {
            body.push_str(line);
            body.push('\n');
        }
    }
    if let Some(prev) = current.take() {
        sections.insert(prev, body);
    }
    sections
}

fn parse_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `output_schema` lines of the form `field: type [required]`.
fn parse_output_schema(body: &str, file_label: &str) -> Result<OutputSchema, ContractError> {
    let mut fields = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, rest) = line.split_once(':').ok_or_else(|| {
            ContractError::MalformedOutputSchema {
                file: file_label.to_string(),
                line: line.to_string(),
            }
        })?;
        let mut parts = rest.split_whitespace();
        let type_token = parts.next().ok_or_else(|| ContractError::MalformedOutputSchema {
            file: file_label.to_string(),
            line: line.to_string(),
        })?;
        let field_type = match type_token {
            "string" => FieldType::String,
            "number" => FieldType::Number,
            "boolean" => FieldType::Boolean,
            "array" => FieldType::Array,
            "object" => FieldType::Object,
            "any" => FieldType::Any,
            _ => {
                return Err(ContractError::MalformedOutputSchema {
                    file: file_label.to_string(),
                    line: line.to_string(),
                })
            }
        };
        let required = parts.any(|p| p == "required");
        fields.push(OutputField {
            name: name.trim().to_string(),
            required,
            field_type,
        });
    }
    Ok(OutputSchema { fields })
}
