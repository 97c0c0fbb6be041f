use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use jiff::{SignedDuration, Timestamp};
use subtle::ConstantTimeEq;

use swdfleet_core::random_token;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid operator password")]
    InvalidPassword,
    #[error("invalid operator token")]
    InvalidToken,
}

/// Short-lived operator bearer sessions. There is no explicit logout;
/// sessions lapse at their expiry and are evicted opportunistically.
pub struct OperatorAuth {
    password: String,
    ttl: SignedDuration,
    sessions: Mutex<HashMap<String, Timestamp>>,
}

impl OperatorAuth {
    pub fn new(password: impl Into<String>, ttl: SignedDuration) -> Self {
        Self {
            password: password.into(),
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Validates the password and mints a bearer token expiring `ttl` from
    /// `now`.
    pub fn login(&self, password: &str, now: Timestamp) -> Result<(String, Timestamp), AuthError> {
        if !bool::from(password.as_bytes().ct_eq(self.password.as_bytes())) {
            return Err(AuthError::InvalidPassword);
        }

        let token = random_token("op", 16);
        let expires_at = now.saturating_add(self.ttl).expect("duration overflow");

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(token.clone(), expires_at);
        sessions.retain(|_, expiry| now <= *expiry);

        Ok((token, expires_at))
    }

    /// Checks the token; unknown or expired tokens are removed and rejected.
    pub fn validate(&self, token: &str, now: Timestamp) -> Result<(), AuthError> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(token) {
            Some(expires_at) if now <= *expires_at => Ok(()),
            _ => {
                sessions.remove(token);
                Err(AuthError::InvalidToken)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_and_validate_lifecycle() {
        let auth = OperatorAuth::new("secret", SignedDuration::from_hours(1));
        let now = Timestamp::from_second(1000).unwrap();

        let (token, expires_at) = auth.login("secret", now).unwrap();
        assert!(token.starts_with("op_"));
        assert_eq!(
            expires_at,
            now.saturating_add(SignedDuration::from_hours(1))
                .expect("duration overflow")
        );

        auth.validate(
            &token,
            now.saturating_add(SignedDuration::from_mins(10))
                .expect("duration overflow"),
        )
        .unwrap();

        let late = now
            .saturating_add(SignedDuration::from_hours(2))
            .expect("duration overflow");
        assert!(matches!(
            auth.validate(&token, late),
            Err(AuthError::InvalidToken)
        ));
        // The expired token stays invalid even before its original expiry.
        assert!(matches!(
            auth.validate(&token, now),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn wrong_password_rejected() {
        let auth = OperatorAuth::new("secret", SignedDuration::from_hours(1));
        assert!(matches!(
            auth.login("nope", Timestamp::from_second(0).unwrap()),
            Err(AuthError::InvalidPassword)
        ));
    }

    #[test]
    fn unknown_token_rejected() {
        let auth = OperatorAuth::new("secret", SignedDuration::from_hours(1));
        assert!(matches!(
            auth.validate("op_deadbeef", Timestamp::from_second(0).unwrap()),
            Err(AuthError::InvalidToken)
        ));
    }
}
