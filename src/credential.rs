use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a credential URL after sanitizing.
pub const MAX_URL_LEN: usize = 2048;
/// Maximum length of a username after trimming.
pub const MAX_USERNAME_LEN: usize = 255;
/// Maximum length of a password. Passwords are never trimmed.
pub const MAX_PASSWORD_LEN: usize = 1000;

/// The site family a credential belongs to.
///
/// Stored as a lowercase string; unknown values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    #[default]
    Salesforce,
    Github,
    Aws,
    Azure,
    Other(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::Salesforce => "salesforce",
            Platform::Github => "github",
            Platform::Aws => "aws",
            Platform::Azure => "azure",
            Platform::Other(name) => name,
        }
    }

    /// Human-readable name, e.g. `Salesforce`.
    pub fn display_name(&self) -> String {
        let name = self.as_str();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }

    /// Whether one-click login knows the login form shape for this platform.
    pub fn supports_autofill(&self) -> bool {
        matches!(self, Platform::Salesforce)
    }

    /// Default login URL for a named environment of this platform, if any.
    pub fn environment_url(&self, environment: Environment) -> Option<&'static str> {
        match (self, environment) {
            (Platform::Salesforce, Environment::Production) => Some("https://login.salesforce.com"),
            (Platform::Salesforce, Environment::Sandbox) => Some("https://test.salesforce.com"),
            _ => None,
        }
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" | "salesforce" => Platform::Salesforce,
            "github" => Platform::Github,
            "aws" => Platform::Aws,
            "azure" => Platform::Azure,
            _ => Platform::Other(normalized),
        }
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deployment environment used to pick a preset login URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Production,
    Sandbox,
}

/// A stored login tuple. Immutable once created.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(default)]
    pub platform: Platform,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Raw user input for a new credential, before sanitizing.
#[derive(Debug, Clone, Default)]
pub struct NewCredential {
    pub platform: Platform,
    pub url: String,
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Sanitize and validate user input, assigning a fresh id.
    pub fn create(input: NewCredential) -> Result<Credential, String> {
        let url = sanitize_input(&input.url, MAX_URL_LEN);
        let username = sanitize_input(&input.username, MAX_USERNAME_LEN);
        let credential = Credential {
            id: new_credential_id(),
            platform: input.platform,
            url,
            username,
            password: input.password,
        };
        credential.validate()?;
        Ok(credential)
    }

    /// Check the invariants every stored or requested credential must hold.
    pub fn validate(&self) -> Result<(), String> {
        validate_url(&self.url)?;
        validate_length("username", &self.username, MAX_USERNAME_LEN)?;
        validate_length("password", &self.password, MAX_PASSWORD_LEN)?;
        Ok(())
    }

    /// URL without its scheme, for listings.
    pub fn url_display(&self) -> &str {
        self.url
            .strip_prefix("https://")
            .or_else(|| self.url.strip_prefix("http://"))
            .unwrap_or(&self.url)
    }
}

pub fn new_credential_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Trim surrounding whitespace and cut to at most `max_len` characters.
pub fn sanitize_input(value: &str, max_len: usize) -> String {
    value.trim().chars().take(max_len).collect()
}

/// Accept only absolute `http`/`https` URLs with no script or data payload.
pub fn validate_url(value: &str) -> Result<url::Url, String> {
    let parsed =
        url::Url::parse(value).map_err(|err| format!("invalid URL '{value}': {err}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!(
            "invalid URL '{value}': only http:// and https:// are allowed"
        ));
    }
    let lowered = value.to_ascii_lowercase();
    if lowered.contains("javascript:") || lowered.contains("data:") {
        return Err(format!(
            "invalid URL '{value}': script and data URLs are not allowed"
        ));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(format!("invalid URL '{value}': missing host"));
    }
    Ok(parsed)
}

fn validate_length(field: &str, value: &str, max_len: usize) -> Result<(), String> {
    let len = value.chars().count();
    if len == 0 || len > max_len {
        return Err(format!(
            "{field} must be between 1 and {max_len} characters (got {len})"
        ));
    }
    Ok(())
}
