//! Ambient caller session
//!
//! The HTTP layer (outside this crate) scopes each request's future with the
//! caller's session; middleware reads it back with [`CallerSession::current`].

use std::future::Future;

use crate::backend::User;

tokio::task_local! {
    static CALLER: CallerSession;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthToken {
    pub access_token: String,
    /// Usually `Bearer`
    pub token_type: String,
    pub id_token: Option<String>,
}

impl OAuthToken {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            token_type: "Bearer".to_string(),
            id_token: None,
        }
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    pub fn authorization(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            &self.token_type
        };
        format!("{token_type} {}", self.access_token)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerSession {
    pub user: User,
    pub oauth: Option<OAuthToken>,
    /// Cookies sent by the caller, in request order
    pub cookies: Vec<(String, String)>,
}

impl CallerSession {
    pub fn new(user: User) -> Self {
        Self {
            user,
            ..Default::default()
        }
    }

    pub fn with_oauth(mut self, token: OAuthToken) -> Self {
        self.oauth = Some(token);
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Runs `fut` with this session as the ambient caller.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CALLER.scope(self, fut).await
    }

    /// The session of the request being served, if any.
    pub fn current() -> Option<CallerSession> {
        CALLER.try_with(Clone::clone).ok()
    }
}
