use std::collections::BTreeMap;

/// Parse a `k=v,k2=v2` label list into a BTreeMap. Entries without `=` are ignored.
pub fn parse_labels(sel_str: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in sel_str.split(',') {
        let pair = pair.trim();
        if let Some(eq_pos) = pair.find('=') {
            let key = pair[..eq_pos].trim().to_string();
            let value = pair[eq_pos + 1..].trim().to_string();
            if !key.is_empty() {
                map.insert(key, value);
            }
        }
    }
    map
}

/// Check that every required label is present on the pod with the same value.
pub fn labels_match(
    pod_labels: &BTreeMap<String, String>,
    required: &BTreeMap<String, String>,
) -> bool {
    required
        .iter()
        .all(|(key, value)| pod_labels.get(key) == Some(value))
}

/// Format a duration in whole units the way `kubectl get` prints ages.
pub fn format_age(total_secs: u64) -> String {
    if total_secs < 60 {
        format!("{}s", total_secs)
    } else if total_secs < 3600 {
        format!("{}m", total_secs / 60)
    } else if total_secs < 86400 {
        format!("{}h", total_secs / 3600)
    } else {
        format!("{}d", total_secs / 86400)
    }
}
