//! Client-side view of RFC 6690 link-format payloads returned from `/.well-known/core`.

/// One discovered resource link: the target URI reference plus its attributes in document
/// order.  Attribute values are unquoted; value-less attributes (like `obs`) carry an empty
/// string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebLink {
    pub uri: String,
    pub attributes: Vec<(String, String)>,
}

impl WebLink {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a link-format document.  Malformed entries are skipped rather than failing the
/// whole document; CoAP servers in the wild are not uniformly strict about the grammar.
pub fn parse_link_format(input: &str) -> Vec<WebLink> {
    split_unquoted(input, ',')
        .into_iter()
        .filter_map(parse_single_link)
        .collect()
}

fn parse_single_link(entry: &str) -> Option<WebLink> {
    let mut parts = split_unquoted(entry, ';').into_iter();
    let target = parts.next()?.trim();
    let uri = target.strip_prefix('<')?.strip_suffix('>')?.to_string();

    let attributes = parts
        .map(|attr| match attr.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), unquote(value).to_string()),
            None => (attr.trim().to_string(), String::new()),
        })
        .filter(|(key, _)| !key.is_empty())
        .collect();

    Some(WebLink {
        uri,
        attributes,
    })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Split on `separator` at the top level only, respecting double-quoted attribute values.
fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (index, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                if !input[start..index].is_empty() {
                    parts.push(&input[start..index]);
                }
                start = index + c.len_utf8();
            }
            _ => {}
        }
    }
    if !input[start..].is_empty() {
        parts.push(&input[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple() {
        let links = parse_link_format(r#"</a>;rt="a";ct=50,</b/whatever>;obs"#);
        assert_eq!(links.len(), 2);

        assert_eq!(links[0].uri, "/a");
        assert_eq!(links[0].attribute("rt"), Some("a"));
        assert_eq!(links[0].attribute("ct"), Some("50"));

        assert_eq!(links[1].uri, "/b/whatever");
        assert_eq!(links[1].attribute("obs"), Some(""));
        assert_eq!(links[1].attribute("rt"), None);
    }

    #[test]
    fn test_comma_inside_quoted_value() {
        let links = parse_link_format(r#"</s>;title="a,b",</t>"#);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].attribute("title"), Some("a,b"));
        assert_eq!(links[1].uri, "/t");
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let links = parse_link_format("garbage,</ok>;rt=x");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].uri, "/ok");
        assert_eq!(links[0].attribute("rt"), Some("x"));
    }

    #[test]
    fn test_empty_document() {
        assert!(parse_link_format("").is_empty());
    }
}
