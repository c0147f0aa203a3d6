use std::collections::HashSet;

/// What the validator knows about a candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

/// Reason a file was refused before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{name} is {size} bytes, above the {max} byte limit")]
    TooLarge { name: String, size: u64, max: u64 },

    #[error("{name} has type {mime_type:?}, which is not allowed")]
    TypeNotAllowed { name: String, mime_type: String },

    #[error("{name} is empty")]
    Empty { name: String },
}

/// Accepts or rejects a file by size and MIME type.
///
/// An empty `allowed_types` set means any type is accepted. Entries are
/// compared case-insensitively and `type/*` matches every subtype.
pub fn validate_file(
    file: &FileDescriptor,
    max_file_size: u64,
    allowed_types: &HashSet<String>,
) -> Result<(), ValidationError> {
    if file.size == 0 {
        return Err(ValidationError::Empty {
            name: file.name.clone(),
        });
    }

    if file.size > max_file_size {
        return Err(ValidationError::TooLarge {
            name: file.name.clone(),
            size: file.size,
            max: max_file_size,
        });
    }

    if !allowed_types.is_empty() && !type_allowed(&file.mime_type, allowed_types) {
        return Err(ValidationError::TypeNotAllowed {
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
        });
    }

    Ok(())
}

fn type_allowed(mime_type: &str, allowed: &HashSet<String>) -> bool {
    let mime_type = mime_type.trim().to_ascii_lowercase();
    let top_level = mime_type.split('/').next().unwrap_or_default();

    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_suffix("/*") {
            Some(prefix) => prefix == top_level,
            None => entry == mime_type,
        }
    })
}
