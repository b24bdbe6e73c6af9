/// Derive a stable-ish node identifier.
///
/// Prefers the `EC2_INSTANCE_ID` environment variable.  Falls back to
/// `<hostname>-<random-8-chars>` so that every process gets a unique id even
/// on the same host.
pub fn node_id() -> String {
    std::env::var("EC2_INSTANCE_ID").unwrap_or_else(|_| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{hostname}-{suffix}")
    })
}

/// Value written into a lease key: `<node-id>:<unix-ts>`.
///
/// Only used for diagnostics (`GET` on a stuck lock shows who took it and
/// when); ownership is never checked against it.
pub fn lease_holder(node_id: &str) -> String {
    format!("{node_id}:{}", chrono::Utc::now().timestamp())
}
