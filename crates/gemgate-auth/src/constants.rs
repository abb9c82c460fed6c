//! OAuth client identity and endpoints for the Gemini CLI application.

pub const CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "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";

pub const OAUTH_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

pub const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";

/// Must match the redirect URI registered for the client id.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8085/oauth2callback";
pub const OAUTH_CALLBACK_PORT: u16 = 8085;

/// Clock-skew buffer applied when deciding whether an access token is expired.
pub(crate) const ACCESS_TOKEN_EXPIRY_BUFFER_MS: i64 = 60_000;
