use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("invalid application name: {0}")]
    Application(String),
    #[error("invalid unit name: {0}")]
    Unit(String),
    #[error("invalid machine id: {0}")]
    Machine(String),
    #[error("invalid offer name: {0}")]
    Offer(String),
}

/// Application names are lowercase alphanumeric segments joined by `-`,
/// starting with a letter; every segment after the first holds a letter.
pub fn validate_application_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name.len() > 63 {
        return Err(NameError::Application(format!(
            "'{name}' must be 1-63 characters"
        )));
    }
    if !name.as_bytes()[0].is_ascii_lowercase() {
        return Err(NameError::Application(format!(
            "'{name}' must start with a lowercase letter"
        )));
    }
    for (i, segment) in name.split('-').enumerate() {
        if segment.is_empty() {
            return Err(NameError::Application(format!(
                "'{name}' has an empty segment"
            )));
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(NameError::Application(format!(
                "'{name}' must match [a-z0-9-]"
            )));
        }
        if i > 0 && !segment.bytes().any(|b| b.is_ascii_lowercase()) {
            return Err(NameError::Application(format!(
                "'{name}' has a segment without letters"
            )));
        }
    }
    Ok(())
}

pub fn validate_unit_name(name: &str) -> Result<(), NameError> {
    let Some((app, number)) = name.split_once('/') else {
        return Err(NameError::Unit(format!(
            "'{name}' must be <application>/<number>"
        )));
    };
    validate_application_name(app).map_err(|e| NameError::Unit(e.to_string()))?;
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NameError::Unit(format!("'{name}' has a non-numeric suffix")));
    }
    Ok(())
}

/// Machine ids are a decimal number, optionally followed by
/// `/<container-type>/<number>` pairs.
pub fn validate_machine_id(id: &str) -> Result<(), NameError> {
    let parts: Vec<&str> = id.split('/').collect();
    if parts.len() % 2 == 0 {
        return Err(NameError::Machine(format!("'{id}' is malformed")));
    }
    for (i, part) in parts.iter().enumerate() {
        let ok = if i % 2 == 0 {
            !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
        } else {
            !part.is_empty() && part.bytes().all(|b| b.is_ascii_lowercase())
        };
        if !ok {
            return Err(NameError::Machine(format!("'{id}' is malformed")));
        }
    }
    Ok(())
}

pub fn validate_offer_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name.len() > 64 {
        return Err(NameError::Offer(
            "offer name must be 1-64 characters".to_owned(),
        ));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(NameError::Offer(
            "offer name must match [a-z0-9-]".to_owned(),
        ));
    }
    Ok(())
}
