//! LDAP search filter escaping and construction.
//!
//! Untrusted strings (names and keys received over the local socket) are
//! escaped before being substituted into filter templates, so a request for
//! `*)(uid=*` searches for that literal string instead of rewriting the
//! filter.

use std::borrow::Cow;
use std::fmt::Write;

/// The characters RFC 4515 does not allow to appear literally in a
/// filter value.
fn is_special(c: char) -> bool {
    matches!(c, '*' | '(' | ')' | '\\' | '\0')
}

/// Escape a filter literal.
///
/// Parentheses, asterisk, backslash and NUL are replaced by their `\HH`
/// forms. The return value borrows the input unless escaping was needed.
pub fn escape<'a, S: Into<Cow<'a, str>>>(lit: S) -> Cow<'a, str> {
    let lit = lit.into();
    if !lit.contains(is_special) {
        return lit;
    }
    let mut out = String::with_capacity(lit.len() + 8);
    for c in lit.chars() {
        if is_special(c) {
            // the specials are all ASCII, so two hex digits suffice
            let _ = write!(out, "\\{:02x}", c as u32);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Combine a map's base filter with one attribute=value term, escaping the
/// value: `(&<class>(<attr>=<value>))`.
pub fn and(class_filter: &str, attr: &str, value: &str) -> String {
    format!("(&{}({}={}))", class_filter, attr, escape(value))
}

/// Like [`and`] but with a numeric argument, which needs no escaping.
pub fn and_num(class_filter: &str, attr: &str, value: i64) -> String {
    format!("(&{}({}={}))", class_filter, attr, value)
}

/// Combine a map's base filter with two attribute terms.
pub fn and2(class_filter: &str, attr1: &str, value1: &str, attr2: &str, value2: &str) -> String {
    format!(
        "(&{}({}={})({}={}))",
        class_filter,
        attr1,
        escape(value1),
        attr2,
        escape(value2)
    )
}

/// Disjunction of one attribute over several values:
/// `(|(<attr>=<v1>)(<attr>=<v2>)…)`. Each value is escaped.
pub fn any(attr: &str, values: &[&str]) -> String {
    let mut out = String::from("(|");
    for value in values {
        out.push('(');
        out.push_str(attr);
        out.push('=');
        out.push_str(&escape(*value));
        out.push(')');
    }
    out.push(')');
    out
}

/// Append a search descriptor's extra filter term to an existing filter:
/// `(&<filter>(<extra>))`. The extra term may be written with or without
/// its surrounding parentheses in the configuration.
pub fn with_extra(filter: &str, extra: &str) -> String {
    if extra.starts_with('(') {
        format!("(&{}{})", filter, extra)
    } else {
        format!("(&{}({}))", filter, extra)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_strings_are_borrowed() {
        assert!(matches!(escape("alice"), Cow::Borrowed("alice")));
    }

    #[test]
    fn specials_are_hex_escaped() {
        assert_eq!(escape(r"a*b"), r"a\2ab");
        assert_eq!(escape("(uid=*)"), r"\28uid=\2a\29");
        assert_eq!(escape("back\\slash"), r"back\5cslash");
        assert_eq!(escape("nul\0byte"), r"nul\00byte");
    }

    #[test]
    fn injection_is_neutralized() {
        let filter = and("(objectClass=posixAccount)", "uid", "*)(uid=*");
        assert_eq!(
            filter,
            r"(&(objectClass=posixAccount)(uid=\2a\29\28uid=\2a))"
        );
    }

    #[test]
    fn numeric_filter() {
        assert_eq!(
            and_num("(objectClass=posixAccount)", "uidNumber", 1001),
            "(&(objectClass=posixAccount)(uidNumber=1001))"
        );
    }

    #[test]
    fn list_filter_escapes_each_element() {
        assert_eq!(
            any("memberUid", &["alice", "b*b"]),
            r"(|(memberUid=alice)(memberUid=b\2ab))"
        );
    }

    #[test]
    fn extra_filter_forms() {
        assert_eq!(
            with_extra("(objectClass=posixAccount)", "ou=People"),
            "(&(objectClass=posixAccount)(ou=People))"
        );
        assert_eq!(
            with_extra("(objectClass=posixAccount)", "(ou=People)"),
            "(&(objectClass=posixAccount)(ou=People))"
        );
    }
}
