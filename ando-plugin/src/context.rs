use std::collections::HashMap;

/// Headers a plugin filter is never allowed to set or remove; these are
/// connection-management headers that only the proxy itself may control.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Outcome of applying a filter's requested header mutations. `denied`
/// lists any mutation that targeted a hop-by-hop header and was dropped
/// rather than applied; `denied` being non-empty sets the request's
/// `mutation_denied` flag for the access log.
pub struct MutationResult {
    pub denied: Vec<String>,
}

/// Apply `set` and `remove` to `headers`, skipping any hop-by-hop name.
pub fn apply_mutations(
    headers: &mut HashMap<String, String>,
    set: &HashMap<String, String>,
    remove: &[String],
) -> MutationResult {
    let mut denied = Vec::new();

    for (name, value) in set {
        if is_hop_by_hop(name) {
            denied.push(name.clone());
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    for name in remove {
        if is_hop_by_hop(name) {
            denied.push(name.clone());
            continue;
        }
        headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    MutationResult { denied }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_set_is_denied() {
        let mut headers = HashMap::new();
        let mut set = HashMap::new();
        set.insert("Connection".to_string(), "close".to_string());
        let result = apply_mutations(&mut headers, &set, &[]);
        assert_eq!(result.denied, vec!["Connection".to_string()]);
        assert!(headers.is_empty());
    }

    #[test]
    fn ordinary_header_set_applies() {
        let mut headers = HashMap::new();
        let mut set = HashMap::new();
        set.insert("X-User-Id".to_string(), "42".to_string());
        let result = apply_mutations(&mut headers, &set, &[]);
        assert!(result.denied.is_empty());
        assert_eq!(headers.get("X-User-Id"), Some(&"42".to_string()));
    }

    #[test]
    fn hop_by_hop_remove_is_denied() {
        let mut headers = HashMap::new();
        headers.insert("Transfer-Encoding".to_string(), "chunked".to_string());
        let result = apply_mutations(&mut headers, &HashMap::new(), &["Transfer-Encoding".to_string()]);
        assert_eq!(result.denied, vec!["Transfer-Encoding".to_string()]);
        assert!(headers.contains_key("Transfer-Encoding"));
    }

    #[test]
    fn ordinary_header_remove_applies_case_insensitively() {
        let mut headers = HashMap::new();
        headers.insert("X-Trace".to_string(), "1".to_string());
        let result = apply_mutations(&mut headers, &HashMap::new(), &["x-trace".to_string()]);
        assert!(result.denied.is_empty());
        assert!(headers.is_empty());
    }
}
