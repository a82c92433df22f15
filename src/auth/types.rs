// Session types and backend wire formats

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Storage key of the serialized credential bundle
pub const AUTH_DATA_KEY: &str = "Auth_Data";

/// Storage key whose presence marks that the app has been used before
pub const FIRST_TIME_USE_KEY: &str = "First_Time_Use";

/// Refresh endpoint, relative to the auth backend
pub const REFRESH_PATH: &str = "/api/Auth/refresh-token";

/// Password login endpoint
pub const LOGIN_PATH: &str = "/api/Auth/login";

/// Google ID-token login endpoint
pub const GOOGLE_LOGIN_PATH: &str = "/api/Auth/login/google";

/// Access token together with its expiry; one never exists without the other
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub token: String,
    /// Expiry as epoch milliseconds
    pub expires_at: i64,
}

impl AccessGrant {
    /// Grant issued at `now_millis` that lives for `expires_in` seconds
    pub fn issued(token: String, expires_in: i64, now_millis: i64) -> Self {
        Self {
            token,
            expires_at: now_millis.saturating_add(expires_in.saturating_mul(1000)),
        }
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at
    }
}

/// Everything persisted between app runs about the logged-in user
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "StoredBundle", into = "StoredBundle")]
pub struct CredentialBundle {
    pub access: Option<AccessGrant>,
    pub refresh_token: Option<String>,
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub role: String,
    pub email_verified: Option<bool>,
    pub account_type: Option<String>,
    pub is_first_time_use: bool,
}

impl CredentialBundle {
    pub fn access_token(&self) -> Option<&str> {
        self.access.as_ref().map(|grant| grant.token.as_str())
    }

    pub fn expires_at(&self) -> Option<i64> {
        self.access.as_ref().map(|grant| grant.expires_at)
    }

    /// True when an access token exists and its expiry has passed
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.access
            .as_ref()
            .is_some_and(|grant| grant.is_expired(now_millis))
    }

    /// Copy of this bundle carrying freshly issued tokens; identity fields are kept
    pub fn with_refreshed_tokens(&self, tokens: RefreshData, now_millis: i64) -> Self {
        Self {
            access: Some(AccessGrant::issued(
                tokens.access_token,
                tokens.expires_in,
                now_millis,
            )),
            refresh_token: tokens.refresh_token.or_else(|| self.refresh_token.clone()),
            ..self.clone()
        }
    }

    /// Bundle for a successful login response
    pub fn from_login(data: LoginData, now_millis: i64) -> Self {
        let LoginData {
            token,
            refresh_token,
            expires_in,
            user,
        } = data;

        Self {
            access: Some(AccessGrant::issued(token, expires_in, now_millis)),
            refresh_token,
            user_id: user.id.as_ref().map(id_to_string).unwrap_or_default(),
            username: user.username.unwrap_or_default(),
            email: user.email.unwrap_or_default(),
            role: user.role.unwrap_or_else(|| "user".to_string()),
            email_verified: user.email_verified,
            account_type: user.account_type,
            is_first_time_use: false,
        }
    }
}

/// User ids arrive as strings or numbers depending on the endpoint
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// On-disk layout of the bundle (field names shared with earlier app versions)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredBundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    account_type: Option<String>,
    #[serde(default)]
    is_first_time_use: bool,
}

impl From<StoredBundle> for CredentialBundle {
    fn from(stored: StoredBundle) -> Self {
        let access = match (stored.token.filter(|t| !t.is_empty()), stored.expiry_time) {
            (Some(token), Some(expires_at)) => Some(AccessGrant { token, expires_at }),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("Stored session has a token without expiry (or vice versa); ignoring it");
                None
            }
            (None, None) => None,
        };

        Self {
            access,
            refresh_token: stored.refresh_token.filter(|t| !t.is_empty()),
            user_id: stored.id,
            username: stored.username,
            email: stored.email,
            role: stored.role,
            email_verified: stored.email_verified,
            account_type: stored.account_type,
            is_first_time_use: stored.is_first_time_use,
        }
    }
}

impl From<CredentialBundle> for StoredBundle {
    fn from(bundle: CredentialBundle) -> Self {
        let (token, expiry_time) = match bundle.access {
            Some(grant) => (Some(grant.token), Some(grant.expires_at)),
            None => (None, None),
        };

        Self {
            token,
            expiry_time,
            refresh_token: bundle.refresh_token,
            id: bundle.user_id,
            username: bundle.username,
            email: bundle.email,
            role: bundle.role,
            email_verified: bundle.email_verified,
            account_type: bundle.account_type,
            is_first_time_use: bundle.is_first_time_use,
        }
    }
}

/// Uniform backend envelope `{success, data, message}`
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    /// Some endpoints report validation problems as a list of strings
    #[serde(default)]
    pub error: Option<Value>,
}

impl<T> Envelope<T> {
    /// Best human-readable failure reason in the envelope
    pub fn failure_message(&self) -> Option<String> {
        let first_error = self
            .error
            .as_ref()
            .and_then(|e| e.as_array())
            .and_then(|errors| errors.first())
            .and_then(|e| e.as_str())
            .map(str::to_string);

        first_error.or_else(|| self.message.clone().filter(|m| !m.is_empty()))
    }
}

/// Payload of a successful refresh
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Payload of a successful login
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub user: LoginUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginUser {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    #[serde(default)]
    pub account_type: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Password login request
#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub identifier: &'a str,
    pub password: &'a str,
}

/// Google login request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleLoginRequest<'a> {
    pub id_token: &'a str,
}
