use frame_bus::RelayError;

/// Turn a viewer's request path into the source id handed to the transcoder.
///
/// The path is the URL-encoded source, e.g. `/rtsp%3A%2F%2Fcam%2Flive`.
/// With an empty `allowed_schemes` any non-empty id is accepted; otherwise
/// the decoded id must be a URL using one of the listed schemes. Ids that
/// would read as an option or carry control characters are always refused.
pub fn source_from_path(path: &str, allowed_schemes: &[String]) -> Result<String, RelayError> {
    let encoded = path.trim_start_matches('/');
    if encoded.is_empty() {
        return Err(RelayError::Validation("missing source id".to_string()));
    }

    let decoded = urlencoding::decode(encoded)
        .map_err(|_| RelayError::Validation("source id is not valid UTF-8".to_string()))?;
    let source = decoded.as_ref();
    if source.trim().is_empty() {
        return Err(RelayError::Validation("empty source id".to_string()));
    }
    if source.trim() != source {
        return Err(RelayError::Validation(
            "source id has leading or trailing whitespace".to_string(),
        ));
    }
    if source.starts_with('-') {
        return Err(RelayError::Validation(
            "source id must not start with '-'".to_string(),
        ));
    }
    if source.chars().any(char::is_control) {
        return Err(RelayError::Validation(
            "source id contains control characters".to_string(),
        ));
    }

    if !allowed_schemes.is_empty() {
        let url = url::Url::parse(source)
            .map_err(|e| RelayError::Validation(format!("source id is not a URL: {}", e)))?;
        if !allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(RelayError::Validation(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }
    }

    Ok(source.to_string())
}
