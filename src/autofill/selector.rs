use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_USERNAME_SELECTORS: &[&str] = &[
    "#username",
    r#"input[name="username"]"#,
    r#"input[type="email"]"#,
    r#"input[id*="username"]"#,
    r#"input[name*="username"]"#,
];

const DEFAULT_PASSWORD_SELECTORS: &[&str] = &[
    "#password",
    r#"input[name="pw"]"#,
    r#"input[type="password"]"#,
    r#"input[id*="password"]"#,
    r#"input[name*="password"]"#,
];

const DEFAULT_SUBMIT_SELECTORS: &[&str] = &[
    "#Login",
    r#"input[type="submit"]"#,
    r#"input[name="Login"]"#,
    r#"button[type="submit"]"#,
    r#"input[id*="login"]"#,
    r#"button[id*="login"]"#,
];

/// A CSS selector as written in the config, plus its parsed form.
///
/// Live pages get the original text through `querySelector`; the parsed form
/// matches against in-memory documents and rejects text the browser would
/// throw on.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Selector {
    source: String,
    parsed: scraper::Selector,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Selector, String> {
        let source = input.trim();
        if source.is_empty() {
            return Err("selector must not be empty".to_string());
        }
        let parsed = scraper::Selector::parse(source)
            .map_err(|e| format!("invalid selector '{source}': {e}"))?;
        Ok(Selector {
            source: source.to_string(),
            parsed,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub(crate) fn css(&self) -> &scraper::Selector {
        &self.parsed
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Selector {}

impl TryFrom<String> for Selector {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Selector::parse(&value)
    }
}

impl From<Selector> for String {
    fn from(value: Selector) -> Self {
        value.source
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:?})", self.source)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The role a discovered element plays in the login form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Username,
    Password,
    Submit,
}

impl fmt::Display for FieldRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldRole::Username => "username",
            FieldRole::Password => "password",
            FieldRole::Submit => "submit",
        })
    }
}

/// Ordered selector candidates per role; the first candidate that matches wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorCascade {
    #[serde(default = "default_username_selectors")]
    pub username: Vec<Selector>,
    #[serde(default = "default_password_selectors")]
    pub password: Vec<Selector>,
    #[serde(default = "default_submit_selectors")]
    pub submit: Vec<Selector>,
}

impl Default for SelectorCascade {
    fn default() -> Self {
        Self {
            username: default_username_selectors(),
            password: default_password_selectors(),
            submit: default_submit_selectors(),
        }
    }
}

impl SelectorCascade {
    pub fn candidates(&self, role: FieldRole) -> &[Selector] {
        match role {
            FieldRole::Username => &self.username,
            FieldRole::Password => &self.password,
            FieldRole::Submit => &self.submit,
        }
    }
}

fn parse_builtin(list: &[&str]) -> Vec<Selector> {
    list.iter()
        .filter_map(|source| Selector::parse(source).ok())
        .collect()
}

fn default_username_selectors() -> Vec<Selector> {
    parse_builtin(DEFAULT_USERNAME_SELECTORS)
}

fn default_password_selectors() -> Vec<Selector> {
    parse_builtin(DEFAULT_PASSWORD_SELECTORS)
}

fn default_submit_selectors() -> Vec<Selector> {
    parse_builtin(DEFAULT_SUBMIT_SELECTORS)
}
