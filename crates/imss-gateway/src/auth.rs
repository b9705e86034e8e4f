use async_trait::async_trait;

/// Validates the handshake token declared for a userId. Kept as a trait so a
/// real deployment can swap in whatever identity provider issues these
/// tokens without touching the session-open path.
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn authenticate(&self, user_id: i64, token: &str) -> bool;
}

/// Single shared-secret authenticator: every userId accepts the same bearer
/// token. Good enough for a reference deployment or tests; production
/// installs would plug in an RPC call to the identity service here.
pub struct SharedSecretAuthenticator {
    expected: String,
}

impl SharedSecretAuthenticator {
    #[must_use]
    pub fn new(expected: impl Into<String>) -> Self {
        Self { expected: expected.into() }
    }
}

#[async_trait]
impl TokenAuthenticator for SharedSecretAuthenticator {
    async fn authenticate(&self, _user_id: i64, token: &str) -> bool {
        safe_equal(token, &self.expected)
    }
}

/// Constant-time comparison so token checks don't leak length-dependent
/// timing information.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.as_bytes().iter().zip(b.as_bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}
