use axum::http::{header, HeaderMap};

use crate::api::ApiError;

/// Bearer tokens for the two access levels. The admin token also grants operator access.
#[derive(Clone, Debug, Default)]
pub struct Tokens {
    operator: Option<String>,
    admin: Option<String>,
}

impl Tokens {
    pub fn new(operator: Option<String>, admin: Option<String>) -> Self {
        Self {
            operator: operator.filter(|token| !token.is_empty()),
            admin: admin.filter(|token| !token.is_empty()),
        }
    }

    pub fn authorize_operator(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let Some(operator) = &self.operator else {
            return Ok(());
        };
        match bearer(headers) {
            Some(token) if token == operator || self.is_admin(token) => Ok(()),
            _ => Err(ApiError::Unauthorized),
        }
    }

    pub fn authorize_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        if self.admin.is_none() {
            return Err(ApiError::Forbidden);
        }
        match bearer(headers) {
            None => Err(ApiError::Unauthorized),
            Some(token) if self.is_admin(token) => Ok(()),
            Some(_) => Err(ApiError::Forbidden),
        }
    }

    fn is_admin(&self, token: &str) -> bool {
        self.admin.as_deref() == Some(token)
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
