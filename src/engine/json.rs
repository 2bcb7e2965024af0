//! Pulling a JSON object literal out of script-embedded page data,
//! e.g. `<script>var data={...};</script>`.

/// Undo the HTML entity escaping that pages apply to inline data.
pub fn unescape_entities(text: &str) -> String {
    text.replace("&#039;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Slice out the JSON between `prefix` and `suffix`.
///
/// With a suffix the slice runs to its *last* occurrence; without one it stops
/// at the first `;` after the prefix. When the prefix is absent (or the
/// markers don't line up) the whole text is returned unchanged.
pub fn extract<'a>(text: &'a str, prefix: Option<&str>, suffix: Option<&str>) -> &'a str {
    let Some(prefix) = prefix.filter(|p| !p.is_empty()) else {
        return text;
    };
    let Some(at) = text.find(prefix) else {
        return text;
    };
    let start = at + prefix.len();
    let rest = &text[start..];

    match suffix {
        Some(suffix) => match text.rfind(suffix) {
            Some(end) if end >= start => &text[start..end],
            _ => text,
        },
        None => match rest.find(';') {
            Some(end) => &rest[..end],
            None => rest,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_prefix_and_suffix() {
        let body = r#"var data={"a":1};"#;
        assert_eq!(extract(body, Some("var data="), Some(";")), r#"{"a":1}"#);
    }

    #[test]
    fn test_extract_uses_last_suffix() {
        let body = r#"<script>cb({"s":"x;y"});</script>"#;
        assert_eq!(extract(body, Some("cb("), Some(");")), r#"{"s":"x;y"}"#);
    }

    #[test]
    fn test_extract_without_suffix_stops_at_semicolon() {
        let body = r#"window.cfg = {"k":[1,2]}; init();"#;
        assert_eq!(extract(body, Some("window.cfg = "), None), r#"{"k":[1,2]}"#);
    }

    #[test]
    fn test_extract_passthrough() {
        assert_eq!(extract(r#"{"a":1}"#, None, None), r#"{"a":1}"#);
        assert_eq!(extract(r#"{"a":1}"#, Some("var x="), Some(";")), r#"{"a":1}"#);
        // suffix only before the prefix
        assert_eq!(extract("; var x=1", Some("var x="), Some(";")), "; var x=1");
    }

    #[test]
    fn test_unescape_entities() {
        assert_eq!(
            unescape_entities("{&quot;q&quot;:&quot;a &amp;&amp; b &lt; c&quot;,&quot;n&quot;:&quot;O&#039;Brien&quot;}"),
            r#"{"q":"a && b < c","n":"O'Brien"}"#
        );
        assert_eq!(unescape_entities("&amp;lt;"), "&lt;");
    }
}
