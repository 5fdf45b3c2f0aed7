/// Maximum member name length.
pub const MAX_NAME_LENGTH: usize = 20;

/// Maximum room name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 30;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Validate a member name. Must be 1-20 chars, alphanumeric + underscore/hyphen.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".into());
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(format!(
            "Name too long (max {} characters)",
            MAX_NAME_LENGTH
        ));
    }
    if !name.chars().all(is_name_char) {
        return Err("Name can only contain letters, numbers, underscores, and hyphens".into());
    }
    Ok(())
}

pub fn is_valid_name(name: &str) -> bool {
    validate_name(name).is_ok()
}

/// Validate a room name. Must be 1-30 chars, alphanumeric + underscore/hyphen.
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Channel name cannot be empty".into());
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err(format!(
            "Channel name too long (max {} characters)",
            MAX_CHANNEL_NAME_LENGTH
        ));
    }
    if !name.chars().all(is_name_char) {
        return Err(
            "Channel name can only contain letters, numbers, underscores, and hyphens".into(),
        );
    }
    Ok(())
}
