use subtle::ConstantTimeEq;

/// Shared secrets issued by provisioning, one per user.
pub trait CredentialStore: Send + Sync {
    fn shared_secret(&self, user_id: &str) -> Option<String>;

    /// Constant-time check of a secret presented by an agent.
    fn verify(&self, user_id: &str, presented: &str) -> bool {
        match self.shared_secret(user_id) {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(presented.as_bytes())),
            None => false,
        }
    }
}
