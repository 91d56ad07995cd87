//! Request shape seen by gates, plus stock key functions.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::throttle::ThrottleKey;

/// What a gate needs to know about an incoming request.
pub trait GateRequest: Send + Sync {
    /// Network address of the caller. Always available, and used as the
    /// fallback throttle key.
    fn remote_addr(&self) -> IpAddr;

    /// Challenge token submitted with the request, if any.
    fn challenge_token(&self) -> Option<&str>;
}

/// A framework-neutral request: caller address, form fields and an optional
/// authenticated user.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    remote_addr: IpAddr,
    fields: HashMap<String, String>,
    user_id: Option<String>,
    challenge_token: Option<String>,
}

impl ActionRequest {
    pub fn new(remote_addr: IpAddr) -> Self {
        Self {
            remote_addr,
            fields: HashMap::new(),
            user_id: None,
            challenge_token: None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_challenge_token(mut self, token: impl Into<String>) -> Self {
        self.challenge_token = Some(token.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

impl GateRequest for ActionRequest {
    fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    fn challenge_token(&self) -> Option<&str> {
        self.challenge_token.as_deref()
    }
}

/// Key functions for [`ActionRequest`].
///
/// Each returns `None` when the identity it needs is missing; the gate then
/// falls back to the caller's address.
pub mod keys {
    use super::*;

    /// Key by caller address only (e.g. `register`).
    ///
    /// Yields no identity, so every request lands in the gate's address
    /// bucket, the same one unkeyed requests fall back to.
    pub fn remote_addr() -> impl Fn(&ActionRequest) -> Option<String> + Send + Sync + 'static {
        |_: &ActionRequest| None
    }

    /// Key by a single form field (e.g. `resendEmail` by email).
    pub fn field(name: &str) -> impl Fn(&ActionRequest) -> Option<String> + Send + Sync + 'static {
        let name = name.to_string();
        move |req: &ActionRequest| req.field(&name).map(normalize)
    }

    /// Key by a form field combined with the caller address (e.g. `login` by `email:ip`).
    pub fn field_and_addr(
        name: &str,
    ) -> impl Fn(&ActionRequest) -> Option<String> + Send + Sync + 'static {
        let name = name.to_string();
        move |req: &ActionRequest| {
            let value = normalize(req.field(&name)?);
            ThrottleKey::composite([value, req.remote_addr.to_string()])
                .map(|key| key.as_str().to_string())
        }
    }

    /// Key by authenticated user id (e.g. `twoFactor`).
    pub fn user_id() -> impl Fn(&ActionRequest) -> Option<String> + Send + Sync + 'static {
        |req: &ActionRequest| req.user_id().map(str::to_string)
    }

    fn normalize(value: &str) -> String {
        value.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ActionRequest {
        ActionRequest::new("127.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_field_and_addr_key() {
        let key_fn = keys::field_and_addr("email");

        let req = request().with_field("email", " A@X.com ");
        assert_eq!(key_fn(&req).as_deref(), Some("a@x.com:127.0.0.1"));

        assert_eq!(key_fn(&request()), None);
        assert_eq!(key_fn(&request().with_field("email", "  ")), None);
    }

    #[test]
    fn test_field_key() {
        let key_fn = keys::field("email");
        let req = request().with_field("email", "b@x.com");
        assert_eq!(key_fn(&req).as_deref(), Some("b@x.com"));
        assert_eq!(key_fn(&request()), None);
    }

    #[test]
    fn test_user_and_addr_keys() {
        let req = request().with_user("user-9");
        assert_eq!(keys::user_id()(&req).as_deref(), Some("user-9"));
        assert_eq!(keys::user_id()(&request()), None);
        assert_eq!(keys::remote_addr()(&request()), None);
    }

    #[test]
    fn test_challenge_token_exposed() {
        let req = request().with_challenge_token("tok");
        assert_eq!(req.challenge_token(), Some("tok"));
        assert_eq!(request().challenge_token(), None);
    }
}
