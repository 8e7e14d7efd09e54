//! Typed cache keys. All keys share the `topup:v1:` namespace.

const NAMESPACE: &str = "topup:v1";

pub mod wallet {
    use std::fmt;

    /// Cached wallet balance for a user
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BalanceKey {
        user_id: String,
    }

    impl BalanceKey {
        pub fn new(user_id: &str) -> Self {
            Self {
                user_id: user_id.to_string(),
            }
        }
    }

    impl fmt::Display for BalanceKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:wallet:balance:{}", super::NAMESPACE, self.user_id)
        }
    }
}

pub mod rate_limit {
    use std::fmt;

    /// Request counter for one subject (user id or client address)
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RequestCounterKey {
        scope: &'static str,
        subject: String,
    }

    impl RequestCounterKey {
        pub fn new(scope: &'static str, subject: &str) -> Self {
            Self {
                scope,
                subject: subject.to_string(),
            }
        }
    }

    impl fmt::Display for RequestCounterKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:ratelimit:{}:{}", super::NAMESPACE, self.scope, self.subject)
        }
    }
}
