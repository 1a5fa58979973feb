/// Whether the caller asked for the child nodes of the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListSubnodes {
    #[default]
    Unknown,
    Yes,
    No,
}

impl ListSubnodes {
    /// Numeric encoding used by existing callers (-1, 0, 1).
    pub fn raw(self) -> i8 {
        match self {
            ListSubnodes::Unknown => -1,
            ListSubnodes::Yes => 0,
            ListSubnodes::No => 1,
        }
    }
}

/// A request target split into its parts.
///
/// `payload` is borrowed from the caller and never touched by [`parse_uri`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UriElements<'a> {
    pub device_id: Option<String>,
    pub target_node: Option<String>,
    pub list_subnodes: ListSubnodes,
    pub payload: Option<&'a str>,
}

impl<'a> UriElements<'a> {
    /// Elements for a node on an already known device.
    pub fn node(target_node: &str) -> Self {
        Self {
            device_id: None,
            target_node: Some(target_node.to_string()),
            list_subnodes: if target_node.ends_with('/') {
                ListSubnodes::Yes
            } else {
                ListSubnodes::No
            },
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Option<&'a str>) -> Self {
        self.payload = payload;
        self
    }

    /// True for the "enumerate root categories" request.
    pub fn is_root_listing(&self) -> bool {
        self.target_node.as_deref().is_some_and(str::is_empty)
            && self.list_subnodes == ListSubnodes::Yes
    }
}

/// Splits `device_id/target/node[/]`.
///
/// A missing or empty URI yields empty elements; callers check `device_id`
/// before dispatching. No decoding or validation is applied.
pub fn parse_uri<'a>(uri: Option<&str>) -> UriElements<'a> {
    let uri = match uri {
        Some(u) if !u.is_empty() => u,
        _ => {
            tracing::debug!("got empty uri");
            return UriElements::default();
        }
    };
    let list_subnodes = if uri.ends_with('/') {
        ListSubnodes::Yes
    } else {
        ListSubnodes::No
    };
    let (device_id, target_node) = uri.split_once('/').unwrap_or((uri, ""));
    tracing::trace!(uri, device_id, target_node, "parsed uri");
    UriElements {
        device_id: Some(device_id.to_string()),
        target_node: Some(target_node.to_string()),
        list_subnodes,
        payload: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_and_node() {
        let e = parse_uri(Some("someID/info"));
        assert_eq!(e.device_id.as_deref(), Some("someID"));
        assert_eq!(e.target_node.as_deref(), Some("info"));
        assert_eq!(e.list_subnodes, ListSubnodes::No);
        assert_eq!(e.list_subnodes.raw(), 1);
    }

    #[test]
    fn test_trailing_slash_lists_subnodes() {
        let e = parse_uri(Some("someID/info/"));
        assert_eq!(e.target_node.as_deref(), Some("info/"));
        assert_eq!(e.list_subnodes, ListSubnodes::Yes);
        assert_eq!(e.list_subnodes.raw(), 0);
    }

    #[test]
    fn test_null_and_empty_are_equal() {
        let a = parse_uri(None);
        let b = parse_uri(Some(""));
        assert_eq!(a, b);
        assert_eq!(a.device_id, None);
        assert_eq!(a.target_node, None);
        assert_eq!(a.list_subnodes, ListSubnodes::Unknown);
    }

    #[test]
    fn test_device_only_forms() {
        let e = parse_uri(Some("dev"));
        assert_eq!(e.device_id.as_deref(), Some("dev"));
        assert_eq!(e.target_node.as_deref(), Some(""));
        assert_eq!(e.list_subnodes, ListSubnodes::No);

        let e = parse_uri(Some("dev/"));
        assert_eq!(e.target_node.as_deref(), Some(""));
        assert!(e.is_root_listing());
    }

    #[test]
    fn test_leading_slash_gives_empty_device() {
        let e = parse_uri(Some("/someID/info"));
        assert_eq!(e.device_id.as_deref(), Some(""));
        assert_eq!(e.target_node.as_deref(), Some("someID/info"));
    }

    #[test]
    fn test_roundtrip_without_trailing_slash() {
        for uri in ["a/b", "dev/conf/mqtt", "x/y%20z", "id/a/b/c"] {
            let e = parse_uri(Some(uri));
            let joined = format!(
                "{}/{}",
                e.device_id.unwrap_or_default(),
                e.target_node.unwrap_or_default()
            );
            assert_eq!(joined, uri);
        }
    }

    #[test]
    fn test_payload_is_left_alone() {
        let e = parse_uri(Some("d/n")).with_payload(Some("{\"a\":1}"));
        assert_eq!(e.payload, Some("{\"a\":1}"));
        assert_eq!(parse_uri(Some("d/n")).payload, None);
    }
}
