//! Kubernetes resource naming
//!
//! Maps arbitrary display names onto the DNS-label grammar the cluster
//! accepts: lowercase `[a-z0-9-]`, starting and ending with an alphanumeric.
//! The mapping is lossy, so distinct display names may collapse to the same
//! resource name.

/// Default maximum length of a resource name
pub const DEFAULT_MAX_LEN: usize = 63;

/// Sanitize a name using the default length cap
pub fn k8s_name(name: &str) -> String {
    sanitize(name, DEFAULT_MAX_LEN)
}

/// Convert a display name into a cluster-legal resource name
pub fn sanitize(name: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(name.len().min(max_len));

    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };

        // Collapse runs and drop leading hyphens
        if mapped == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(mapped);
    }

    // Output is pure ASCII, so byte truncation is char-safe
    out.truncate(max_len);

    while out.ends_with('-') {
        out.pop();
    }

    out
}
