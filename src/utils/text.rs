/// JavaScript string literal with JSON escaping.
pub fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

/// `require('m')` in the single-quoted form module specifiers conventionally
/// use; falls back to JSON escaping for awkward specifiers.
pub fn require_call(mpath: &str) -> String {
    if mpath
        .chars()
        .all(|c| c != '\'' && c != '\\' && c != '\n' && c != '\r')
    {
        format!("require('{}')", mpath)
    } else {
        format!("require({})", js_string(mpath))
    }
}
