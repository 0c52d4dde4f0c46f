//! LDAP search filters (RFC 4515).
//!
//! Filters are built as a [`Filter`] tree and rendered with `Display`, so
//! user-supplied values are always escaped. Configured filter strings are
//! parsed into the same tree, which lets [`super::memory::InMemoryDirectory`]
//! evaluate them and lets config validation reject malformed templates early.

use std::fmt;

use ldap3::ldap_escape;
use regex::Regex;

use super::DirectoryError;
use crate::config::ProviderConfig;

/// A search filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// All children match
    And(Vec<Filter>),
    /// Any child matches
    Or(Vec<Filter>),
    /// Child does not match
    Not(Box<Filter>),
    /// Attribute has exactly this value
    Equals {
        /// Attribute name
        attr: String,
        /// Literal value
        value: String,
    },
    /// Attribute matches a wildcard pattern; `parts` are the literal
    /// segments between `*` characters
    Substring {
        /// Attribute name
        attr: String,
        /// Literal segments
        parts: Vec<String>,
    },
    /// Attribute is present
    Present(String),
}

impl Filter {
    /// `(attr=value)` with `value` taken literally.
    #[must_use]
    pub fn eq(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Equals {
            attr: attr.into(),
            value: value.into(),
        }
    }

    /// `(attr=*)`
    #[must_use]
    pub fn present(attr: impl Into<String>) -> Self {
        Self::Present(attr.into())
    }

    /// `(attr=pattern)` where `*` in `pattern` is a wildcard.
    #[must_use]
    pub fn pattern(attr: impl Into<String>, pattern: &str) -> Self {
        if pattern == "*" {
            Self::Present(attr.into())
        } else if pattern.contains('*') {
            Self::Substring {
                attr: attr.into(),
                parts: pattern.split('*').map(str::to_string).collect(),
            }
        } else {
            Self::eq(attr, pattern)
        }
    }

    /// Conjunction; a single child is returned unwrapped.
    #[must_use]
    pub fn and(mut children: Vec<Filter>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::And(children)
        }
    }

    /// Disjunction; a single child is returned unwrapped.
    #[must_use]
    pub fn or(mut children: Vec<Filter>) -> Self {
        if children.len() == 1 {
            children.remove(0)
        } else {
            Self::Or(children)
        }
    }

    /// Negation.
    #[must_use]
    pub fn not(child: Filter) -> Self {
        Self::Not(Box::new(child))
    }

    /// An empty disjunction matches nothing; callers skip the search.
    #[must_use]
    pub fn is_empty_or(&self) -> bool {
        matches!(self, Self::Or(c) if c.is_empty())
    }

    /// Parse a filter string. A bare `attr=value` without parentheses is accepted.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::InvalidFilter`] on unbalanced parentheses, unsupported
    /// operators or trailing input.
    pub fn parse(input: &str) -> Result<Self, DirectoryError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(invalid(input, "empty filter"));
        }
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({trimmed})");
            &owned
        };
        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser
            .filter()
            .map_err(|msg| invalid(input, msg))?;
        if parser.pos != parser.input.len() {
            return Err(invalid(input, "trailing characters"));
        }
        Ok(filter)
    }
}

fn invalid(input: &str, msg: &str) -> DirectoryError {
    DirectoryError::InvalidFilter(format!("{msg} in '{input}'"))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(children) | Self::Or(children) if children.len() == 1 => {
                write!(f, "{}", children[0])
            }
            Self::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Self::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Self::Not(child) => write!(f, "(!{child})"),
            Self::Equals { attr, value } => write!(f, "({attr}={})", ldap_escape(value.as_str())),
            Self::Substring { attr, parts } => {
                let escaped: Vec<String> = parts
                    .iter()
                    .map(|p| ldap_escape(p.as_str()).into_owned())
                    .collect();
                write!(f, "({attr}={})", escaped.join("*"))
            }
            Self::Present(attr) => write!(f, "({attr}=*)"),
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), &'static str> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else if byte == b')' {
            Err("unbalanced parentheses")
        } else {
            Err("expected '('")
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn filter(&mut self) -> Result<Filter, &'static str> {
        self.skip_spaces();
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::not(self.filter()?)
            }
            Some(_) => self.item()?,
            None => return Err("unbalanced parentheses"),
        };
        self.skip_spaces();
        self.expect(b')')?;
        Ok(filter)
    }

    fn list(&mut self) -> Result<Vec<Filter>, &'static str> {
        let mut children = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek() {
                Some(b'(') => children.push(self.filter()?),
                Some(b')') => return Ok(children),
                _ => return Err("unbalanced parentheses"),
            }
        }
    }

    fn item(&mut self) -> Result<Filter, &'static str> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b'=' || b == b')' || b == b'(' {
                break;
            }
            self.pos += 1;
        }
        if self.peek() != Some(b'=') {
            return Err("missing '='");
        }
        let attr = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "attribute name is not UTF-8")?
            .trim();
        if attr.is_empty() {
            return Err("missing attribute name");
        }
        if attr.ends_with(['<', '>', ':']) {
            return Err("unsupported comparison operator");
        }
        let attr = attr.trim_end_matches('~').to_string();
        self.pos += 1;

        // Literal segments separated by unescaped '*'
        let mut parts: Vec<Vec<u8>> = vec![Vec::new()];
        loop {
            match self.peek() {
                None | Some(b'(') => return Err("unbalanced parentheses"),
                Some(b')') => break,
                Some(b'*') => {
                    parts.push(Vec::new());
                    self.pos += 1;
                }
                Some(b'\\') => {
                    let hex = self
                        .input
                        .get(self.pos + 1..self.pos + 3)
                        .ok_or("truncated escape")?;
                    let hex = std::str::from_utf8(hex).map_err(|_| "invalid escape")?;
                    let byte = u8::from_str_radix(hex, 16).map_err(|_| "invalid escape")?;
                    if let Some(last) = parts.last_mut() {
                        last.push(byte);
                    }
                    self.pos += 3;
                }
                Some(b) => {
                    if let Some(last) = parts.last_mut() {
                        last.push(b);
                    }
                    self.pos += 1;
                }
            }
        }
        let parts: Vec<String> = parts
            .into_iter()
            .map(|p| String::from_utf8_lossy(&p).into_owned())
            .collect();
        Ok(match parts.as_slice() {
            [single] => Filter::eq(attr, single.clone()),
            [a, b] if a.is_empty() && b.is_empty() => Filter::Present(attr),
            _ => Filter::Substring { attr, parts },
        })
    }
}

/// Replace `{name}` placeholders in a filter template with escaped values.
///
/// # Errors
///
/// [`DirectoryError::InvalidFilter`] when the template names a placeholder
/// that is not in `values`.
pub fn expand_template(template: &str, values: &[(&str, &str)]) -> Result<String, DirectoryError> {
    let re = Regex::new(r"\{([A-Za-z_]+)\}")
        .map_err(|e| DirectoryError::InvalidFilter(e.to_string()))?;
    let mut unknown = None;
    let expanded = re.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        if let Some((_, value)) = values.iter().find(|(k, _)| *k == name) {
            ldap_escape(*value).into_owned()
        } else {
            unknown.get_or_insert_with(|| name.to_string());
            String::new()
        }
    });
    match unknown {
        Some(name) => Err(DirectoryError::InvalidFilter(format!(
            "unknown placeholder '{{{name}}}' in '{template}'"
        ))),
        None => Ok(expanded.into_owned()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema filters
// ─────────────────────────────────────────────────────────────────────────────

/// `(|(&(objectClass=U)(|(login=p)(name=p)))...)` over all user mappings.
#[must_use]
pub fn user_search_filter(config: &ProviderConfig, pattern: &str) -> Filter {
    Filter::or(
        config
            .user_mappings
            .iter()
            .map(|m| {
                Filter::and(vec![
                    Filter::eq("objectClass", &m.object_class),
                    Filter::or(vec![
                        Filter::pattern(&m.login_attr, pattern),
                        Filter::pattern(&m.name_attr, pattern),
                    ]),
                ])
            })
            .collect(),
    )
}

/// Users whose login attribute equals `login` exactly.
#[must_use]
pub fn user_login_filter(config: &ProviderConfig, login: &str) -> Filter {
    Filter::or(
        config
            .user_mappings
            .iter()
            .map(|m| {
                Filter::and(vec![
                    Filter::eq("objectClass", &m.object_class),
                    Filter::eq(&m.login_attr, login),
                ])
            })
            .collect(),
    )
}

/// Groups whose name attribute matches `pattern`.
#[must_use]
pub fn group_search_filter(config: &ProviderConfig, pattern: &str) -> Filter {
    Filter::or(
        config
            .group_mappings
            .iter()
            .map(|m| {
                Filter::and(vec![
                    Filter::eq("objectClass", &m.object_class),
                    Filter::pattern(&m.name_attr, pattern),
                ])
            })
            .collect(),
    )
}

/// Entries carrying a certificate, or the configured index filter.
///
/// # Errors
///
/// [`DirectoryError::InvalidFilter`] when the configured index filter does not parse.
pub fn cert_presence_filter(config: &ProviderConfig) -> Result<Filter, DirectoryError> {
    if let Some(custom) = &config.certificates.index_filter {
        return Filter::parse(custom);
    }
    Ok(Filter::or(
        config
            .user_mappings
            .iter()
            .filter_map(|m| {
                m.cert_attr.as_ref().map(|attr| {
                    Filter::and(vec![
                        Filter::eq("objectClass", &m.object_class),
                        Filter::present(attr),
                    ])
                })
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupMapping, MemberStrategy, UserMapping};

    #[test]
    fn renders_nested_filters() {
        let f = Filter::and(vec![
            Filter::eq("objectClass", "person"),
            Filter::or(vec![Filter::eq("uid", "bob"), Filter::present("mail")]),
        ]);
        assert_eq!(f.to_string(), "(&(objectClass=person)(|(uid=bob)(mail=*)))");
    }

    #[test]
    fn single_child_is_unwrapped() {
        let f = Filter::or(vec![Filter::eq("cn", "a")]);
        assert_eq!(f.to_string(), "(cn=a)");
    }

    #[test]
    fn values_are_escaped() {
        let f = Filter::eq("cn", "a*(b)\\c");
        assert_eq!(f.to_string(), r"(cn=a\2a\28b\29\5cc)");
        let f = Filter::pattern("cn", "jo*n(");
        assert_eq!(f.to_string(), r"(cn=jo*n\28)");
    }

    #[test]
    fn parse_round_trips_rendered_filters() {
        let text = r"(&(objectClass=person)(|(cn=jo*n)(!(uid=a\2ab)))(mail=*))";
        let parsed = Filter::parse(text).unwrap();
        assert_eq!(parsed.to_string(), text);
        assert_eq!(
            Filter::parse("uid=bob").unwrap(),
            Filter::eq("uid", "bob")
        );
    }

    #[test]
    fn parse_rejects_malformed_input() {
        for bad in ["", "(cn=a", "(&(cn=a)", "(cn)", "(cn=a))", "(age>=3)", "(=a)"] {
            assert!(
                matches!(Filter::parse(bad), Err(DirectoryError::InvalidFilter(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn template_expansion_escapes_values() {
        let out = expand_template(
            "(&(objectClass=person)(ski={ski}))",
            &[("ski", "ab*c")],
        )
        .unwrap();
        assert_eq!(out, r"(&(objectClass=person)(ski=ab\2ac))");
        assert!(expand_template("(x={missing})", &[("ski", "a")]).is_err());
    }

    fn schema() -> ProviderConfig {
        ProviderConfig {
            user_mappings: vec![UserMapping {
                object_class: "inetOrgPerson".to_string(),
                login_attr: "uid".to_string(),
                name_attr: "cn".to_string(),
                cert_attr: Some("userCertificate".to_string()),
            }],
            group_mappings: vec![
                GroupMapping {
                    object_class: "groupOfNames".to_string(),
                    name_attr: "cn".to_string(),
                    member_attr: "member".to_string(),
                    member_strategy: MemberStrategy::MembersAreDn,
                },
                GroupMapping {
                    object_class: "posixGroup".to_string(),
                    name_attr: "cn".to_string(),
                    member_attr: "memberUid".to_string(),
                    member_strategy: MemberStrategy::MembersAreLogin,
                },
            ],
            ..ProviderConfig::default()
        }
    }

    #[test]
    fn schema_filters() {
        let config = schema();
        assert_eq!(
            user_login_filter(&config, "bob").to_string(),
            "(&(objectClass=inetOrgPerson)(uid=bob))"
        );
        assert_eq!(
            group_search_filter(&config, "*").to_string(),
            "(|(&(objectClass=groupOfNames)(cn=*))(&(objectClass=posixGroup)(cn=*)))"
        );
        assert_eq!(
            cert_presence_filter(&config).unwrap().to_string(),
            "(&(objectClass=inetOrgPerson)(userCertificate=*))"
        );
        assert_eq!(
            user_search_filter(&config, "b*").to_string(),
            "(&(objectClass=inetOrgPerson)(|(uid=b*)(cn=b*)))"
        );
    }
}
