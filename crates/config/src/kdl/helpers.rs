//! KDL parsing helper functions.
//!
//! Common utilities for extracting values from KDL nodes.

/// Convert a byte offset to line and column numbers (1-indexed)
pub fn offset_to_line_col(content: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in content.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Find a direct child node by name
pub fn find_child<'a>(node: &'a kdl::KdlNode, name: &str) -> Option<&'a kdl::KdlNode> {
    node.children().and_then(|children| children.get(name))
}

/// Helper to get a string entry from a KDL node
pub fn get_string_entry(node: &kdl::KdlNode, name: &str) -> Option<String> {
    find_child(node, name).and_then(get_first_arg_string)
}

/// Helper to get an integer entry from a KDL node
pub fn get_int_entry(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    find_child(node, name)
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_integer())
}

/// Helper to get a boolean entry from a KDL node
pub fn get_bool_entry(node: &kdl::KdlNode, name: &str) -> Option<bool> {
    find_child(node, name)
        .and_then(|n| n.entries().first())
        .and_then(|e| e.value().as_bool())
}

/// Helper to get the first argument of a node as a string
pub fn get_first_arg_string(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// All positional string arguments of a node, in order
pub fn get_string_args(node: &kdl::KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

/// Helper to get a named integer property (`port=443`)
pub fn get_int_prop(node: &kdl::KdlNode, name: &str) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .and_then(|e| e.value().as_integer())
}

/// Convert an integer entry into a target type, naming the field on failure
pub fn int_in_range<T: TryFrom<i128>>(value: i128, field: &str, context: &str) -> anyhow::Result<T> {
    T::try_from(value).map_err(|_| {
        anyhow::anyhow!("{} has out-of-range value {} for '{}'", context, value, field)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_to_line_col() {
        let content = "a\nbc\nd";
        assert_eq!(offset_to_line_col(content, 0), (1, 1));
        assert_eq!(offset_to_line_col(content, 3), (2, 2));
        assert_eq!(offset_to_line_col(content, 5), (3, 1));
    }

    #[test]
    fn test_positional_and_named_entries() {
        let doc: kdl::KdlDocument = r#"authority "sni" port=8443"#.parse().unwrap();
        let node = &doc.nodes()[0];
        assert_eq!(get_first_arg_string(node).as_deref(), Some("sni"));
        assert_eq!(get_int_prop(node, "port"), Some(8443));
        assert_eq!(get_int_prop(node, "missing"), None);
    }

    #[test]
    fn test_string_args() {
        let doc: kdl::KdlDocument = r#"alpn "h2" "http/1.1""#.parse().unwrap();
        assert_eq!(get_string_args(&doc.nodes()[0]), vec!["h2", "http/1.1"]);
    }

    #[test]
    fn test_int_in_range() {
        assert_eq!(int_in_range::<u16>(443, "port", "test").unwrap(), 443);
        assert!(int_in_range::<u16>(70000, "port", "test").is_err());
        assert!(int_in_range::<u64>(-1, "connect", "test").is_err());
    }
}
