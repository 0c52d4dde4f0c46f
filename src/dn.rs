//! Distinguished name helpers.
//!
//! Directory servers hand back DNs with whatever spacing and case the entry
//! was created with. Everything that compares DNs goes through
//! [`canonicalize`]: attribute types and values lowercased, whitespace around
//! separators dropped, multi-valued RDNs sorted. Values are unescaped and
//! re-escaped one way, so `\,` and `\2C` compare equal.

use ldap3::dn_escape;

/// Split a DN into its RDN strings, honouring `\` escapes.
#[must_use]
pub fn split_rdns(dn: &str) -> Vec<&str> {
    split_unescaped(dn, &[',', ';'])
        .into_iter()
        .map(str::trim)
        .filter(|rdn| !rdn.is_empty())
        .collect()
}

fn split_unescaped<'a>(input: &'a str, separators: &[char]) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if separators.contains(&c) {
            parts.push(&input[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&input[start..]);
    parts
}

fn canonical_rdn(rdn: &str) -> String {
    let mut avas: Vec<String> = split_unescaped(rdn, &['+'])
        .into_iter()
        .map(|ava| match ava.split_once('=') {
            Some((ty, value)) => format!(
                "{}={}",
                ty.trim().to_ascii_lowercase(),
                dn_escape(unescape_value(value.trim()).to_lowercase())
            ),
            None => ava.trim().to_lowercase(),
        })
        .collect();
    avas.sort();
    avas.join("+")
}

/// Canonical comparison form of a DN.
#[must_use]
pub fn canonicalize(dn: &str) -> String {
    split_rdns(dn)
        .into_iter()
        .map(canonical_rdn)
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether two DNs name the same entry.
#[must_use]
pub fn same_dn(a: &str, b: &str) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// Whether `dn` equals `ancestor` or lies anywhere below it.
#[must_use]
pub fn is_descendant(dn: &str, ancestor: &str) -> bool {
    let child: Vec<String> = split_rdns(dn).into_iter().map(canonical_rdn).collect();
    let parent: Vec<String> = split_rdns(ancestor).into_iter().map(canonical_rdn).collect();
    parent.len() <= child.len() && child[child.len() - parent.len()..] == parent[..]
}

/// Suffixes of `dn` that start with an `ou=` RDN, excluding the DN itself.
///
/// `cn=bob,ou=eng,ou=staff,dc=x` yields `ou=eng,ou=staff,dc=x` and
/// `ou=staff,dc=x`.
#[must_use]
pub fn ou_suffixes(dn: &str) -> Vec<String> {
    let rdns = split_rdns(dn);
    (1..rdns.len())
        .filter(|&i| {
            rdns[i]
                .split_once('=')
                .is_some_and(|(ty, _)| ty.trim().eq_ignore_ascii_case("ou"))
        })
        .map(|i| rdns[i..].join(","))
        .collect()
}

/// Value of the first RDN, unescaped (`cn=Smith\, J,dc=x` gives `Smith, J`).
#[must_use]
pub fn leading_rdn_value(dn: &str) -> Option<String> {
    let first = split_rdns(dn).into_iter().next()?;
    let (_, value) = first.split_once('=')?;
    Some(unescape_value(value.trim()))
}

/// Undo RFC 4514 escapes, both `\,` and hex pairs like `\2c`.
fn unescape_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 == bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1..i + 3).and_then(|pair| hex::decode(pair).ok()) {
            Some(decoded) => {
                out.extend_from_slice(&decoded);
                i += 3;
            }
            None => {
                out.push(bytes[i + 1]);
                i += 2;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_ignores_case_and_spacing() {
        assert_eq!(
            canonicalize("CN=Bob Smith, OU=Eng ,DC=Example,DC=com"),
            "cn=bob smith,ou=eng,dc=example,dc=com"
        );
        assert!(same_dn("cn=bob,dc=x", "CN=Bob, DC=X"));
    }

    #[test]
    fn escaped_commas_stay_in_the_rdn() {
        assert_eq!(split_rdns(r"cn=Smith\, John,dc=x"), vec![r"cn=Smith\, John", "dc=x"]);
        assert_eq!(leading_rdn_value(r"cn=Smith\, John,dc=x").as_deref(), Some("Smith, John"));
    }

    #[test]
    fn multi_valued_rdns_are_order_insensitive() {
        assert!(same_dn("cn=a+uid=b,dc=x", "UID=b+CN=a,dc=x"));
    }

    #[test]
    fn descendant_matches_suffix_rdns() {
        assert!(is_descendant("cn=bob,ou=eng,dc=x", "ou=eng,dc=x"));
        assert!(is_descendant("cn=bob,ou=eng,dc=x", "OU=Eng, DC=X"));
        assert!(is_descendant("ou=eng,dc=x", "ou=eng,dc=x"));
        assert!(!is_descendant("cn=bob,ou=sales,dc=x", "ou=eng,dc=x"));
        assert!(!is_descendant("dc=x", "ou=eng,dc=x"));
        // "ng,dc=x" is a string suffix but not an RDN suffix
        assert!(!is_descendant("cn=bob,ou=eng,dc=x", "ng,dc=x"));
        assert!(is_descendant("cn=bob,dc=x", ""));
    }

    #[test]
    fn ou_suffixes_skip_the_entry_itself() {
        assert_eq!(
            ou_suffixes("cn=bob,ou=eng,OU=staff,dc=x"),
            vec!["ou=eng,OU=staff,dc=x".to_string(), "OU=staff,dc=x".to_string()]
        );
        assert!(ou_suffixes("ou=eng,dc=x").is_empty());
        assert!(ou_suffixes("cn=you=me,dc=x").is_empty());
    }

    #[test]
    fn hex_and_character_escapes_compare_equal() {
        assert!(same_dn(r"cn=Smith\2C J,dc=x", r"cn=Smith\, J,dc=x"));
        assert!(same_dn(r"cn=a\2bb,dc=x", r"CN=A\+B,DC=x"));
        assert!(!same_dn(r"cn=Smith\, J,dc=x", "cn=Smith,cn=J,dc=x"));
        assert_eq!(canonicalize(r"CN=Smith\, J,DC=x"), r"cn=smith\2c j,dc=x");
        assert_eq!(leading_rdn_value(r"cn=caf\c3\a9,dc=x").as_deref(), Some("café"));
    }
}
