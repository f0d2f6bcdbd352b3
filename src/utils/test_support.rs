//! Helpers shared by integration tests.

/// `true` when the sandbox refuses localhost listeners, so mock-server tests
/// should return early instead of failing.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping mock upstream test: binding localhost is not permitted");
            true
        }
        Err(_) => false,
    }
}
