use serde::{Deserialize, Serialize};

/// User id attached to requests when authentication is not required.
pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserClaims {
    pub sub: String, // user id
    pub name: Option<String>,
    pub roles: Option<Vec<String>>,
    pub exp: usize,
}

/// The authenticated caller, inserted into request extensions.
#[derive(Clone, Debug)]
pub struct UserContext {
    pub user_id: String,
    pub claims: Option<UserClaims>,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            claims: None,
        }
    }
}

impl From<UserClaims> for UserContext {
    fn from(claims: UserClaims) -> Self {
        Self {
            user_id: claims.sub.clone(),
            claims: Some(claims),
        }
    }
}
