use std::borrow::Cow;

use crate::result::{LdapError, Result};

const HEX: &[u8; 16] = b"0123456789abcdef";

fn push_escaped(out: &mut Vec<u8>, c: u8) {
    out.push(b'\\');
    out.push(HEX[(c >> 4) as usize]);
    out.push(HEX[(c & 0xf) as usize]);
}

/// Escape a literal value for use in a search filter.
///
/// RFC 4515 reserves the parentheses, the asterisk, the backslash and NUL
/// inside filter strings; each occurrence is replaced by its `\NN` hex
/// form. Borrowed input that needs no escaping is returned as-is, without
/// allocating.
pub fn ldap_escape<'a, S: Into<Cow<'a, str>>>(lit: S) -> Cow<'a, str> {
    fn reserved(c: u8) -> bool {
        matches!(c, b'(' | b')' | b'*' | b'\\' | 0)
    }

    let lit = lit.into();
    if !lit.bytes().any(reserved) {
        return lit;
    }
    let mut out = Vec::with_capacity(lit.len() + 8);
    for &c in lit.as_bytes() {
        if reserved(c) {
            push_escaped(&mut out, c);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(String::from_utf8(out).expect("escaped filter literal"))
}

/// Escape an attribute value for use in an RDN.
///
/// RFC 4514 reserves a handful of characters anywhere in the value, plus
/// the space and the hash sign in leading position and the space in
/// trailing position; all of them come out in `\NN` hex form. Borrowed
/// input that needs no escaping is returned as-is, without allocating.
///
/// The function is named `dn_escape()` rather than `rdn_escape()` since
/// escaping values while assembling a full DN string is its typical use.
pub fn dn_escape<'a, S: Into<Cow<'a, str>>>(val: S) -> Cow<'a, str> {
    fn reserved(c: u8) -> bool {
        matches!(
            c,
            b'"' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\' | 0
        )
    }

    let val = val.into();
    let bytes = val.as_bytes();
    let positional = |i: usize, c: u8| {
        i == 0 && (c == b' ' || c == b'#') || i + 1 == bytes.len() && c == b' '
    };
    if !bytes
        .iter()
        .enumerate()
        .any(|(i, &c)| reserved(c) || positional(i, c))
    {
        return val;
    }
    let mut out = Vec::with_capacity(bytes.len() + 8);
    for (i, &c) in bytes.iter().enumerate() {
        if reserved(c) || positional(i, c) {
            push_escaped(&mut out, c);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(String::from_utf8(out).expect("escaped rdn value"))
}

/// Split a DN into its RDN components, honoring backslash escapes.
///
/// Quoted RDN values (`cn="a,b"`) are not recognized; RFC 4514 dropped
/// the quoting syntax, and the escaped form is canonical.
fn split_components(dn: &str, sep: u8) -> Vec<&str> {
    let bytes = dn.as_bytes();
    let mut comps = vec![];
    let mut start = 0;
    let mut escaped = false;
    for (i, &c) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if c == b'\\' {
            escaped = true;
        } else if c == sep {
            comps.push(&dn[start..i]);
            start = i + 1;
        }
    }
    comps.push(&dn[start..]);
    comps
}

/// Split a new DN, as given to a rename, into the leading RDN and the
/// remainder, which names the new superior entry. A single-RDN input has
/// no remainder.
pub fn split_new_dn(new_dn: &str) -> (&str, Option<&str>) {
    let mut comps = split_components(new_dn, b',').into_iter();
    let rdn = comps.next().expect("leading rdn");
    let rest = comps.next();
    match rest {
        None => (rdn, None),
        Some(first) => {
            let off = first.as_ptr() as usize - new_dn.as_ptr() as usize;
            (rdn, Some(&new_dn[off..]))
        }
    }
}

/// Check that a DN string has the shape dictated by RFC 4514: a possibly
/// empty sequence of RDNs, each one or more attribute=value pairs.
///
/// This is a shape check, not a full parse: attribute types must be
/// descriptors or numeric OIDs and every pair must have its equals sign,
/// but values are not syntax-checked beyond escape well-formedness.
pub fn validate_dn(dn: &str) -> Result<()> {
    fn valid_attr_type(attr: &str) -> bool {
        let attr = attr.trim();
        if attr.is_empty() {
            return false;
        }
        let bytes = attr.as_bytes();
        if bytes[0].is_ascii_alphabetic() {
            bytes[1..]
                .iter()
                .all(|&c| c.is_ascii_alphanumeric() || c == b'-')
        } else {
            attr.split('.').all(|num| {
                !num.is_empty()
                    && num.bytes().all(|c| c.is_ascii_digit())
                    && (num.len() == 1 || !num.starts_with('0'))
            })
        }
    }

    fn well_escaped(val: &str) -> bool {
        let mut bytes = val.bytes();
        while let Some(c) = bytes.next() {
            if c == b'\\' {
                match bytes.next() {
                    Some(e) if e.is_ascii_hexdigit() => {
                        // \NN hex pair or a single escaped special
                        if let Some(second) = bytes.clone().next() {
                            if second.is_ascii_hexdigit() {
                                bytes.next();
                            }
                        }
                    }
                    Some(_) => (),
                    None => return false,
                }
            }
        }
        true
    }

    if dn.is_empty() {
        return Ok(());
    }
    for rdn in split_components(dn, b',') {
        for pair in split_components(rdn, b'+') {
            let eq = match pair.find('=') {
                Some(pos) => pos,
                None => return Err(LdapError::InvalidDN(dn.to_owned())),
            };
            let (attr, val) = (&pair[..eq], &pair[eq + 1..]);
            if !valid_attr_type(attr) || !well_escaped(val) {
                return Err(LdapError::InvalidDN(dn.to_owned()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{dn_escape, ldap_escape, split_new_dn, validate_dn};

    #[test]
    fn dn_esc_leading_space() {
        assert_eq!(dn_escape(" foo"), "\\20foo");
    }

    #[test]
    fn dn_esc_trailing_space() {
        assert_eq!(dn_escape("foo "), "foo\\20");
    }

    #[test]
    fn dn_esc_inner_space() {
        assert_eq!(dn_escape("f o o"), "f o o");
    }

    #[test]
    fn dn_esc_single_space() {
        assert_eq!(dn_escape(" "), "\\20");
    }

    #[test]
    fn dn_esc_two_spaces() {
        assert_eq!(dn_escape("  "), "\\20\\20");
    }

    #[test]
    fn dn_esc_three_spaces() {
        assert_eq!(dn_escape("   "), "\\20 \\20");
    }

    #[test]
    fn dn_esc_leading_hash() {
        assert_eq!(dn_escape("#rust"), "\\23rust");
    }

    #[test]
    fn dn_esc_comma() {
        assert_eq!(dn_escape("doe, john"), "doe\\2c john");
    }

    #[test]
    fn ldap_esc_star() {
        assert_eq!(ldap_escape("a*b"), "a\\2ab");
    }

    #[test]
    fn ldap_esc_untouched_is_borrowed() {
        assert!(matches!(
            ldap_escape("plain"),
            std::borrow::Cow::Borrowed("plain")
        ));
    }

    #[test]
    fn split_single_rdn() {
        assert_eq!(split_new_dn("cn=new"), ("cn=new", None));
    }

    #[test]
    fn split_rdn_and_superior() {
        assert_eq!(
            split_new_dn("cn=new,ou=people,dc=example,dc=org"),
            ("cn=new", Some("ou=people,dc=example,dc=org"))
        );
    }

    #[test]
    fn split_honors_escaped_comma() {
        assert_eq!(
            split_new_dn("cn=doe\\, john,dc=example"),
            ("cn=doe\\, john", Some("dc=example"))
        );
    }

    #[test]
    fn dn_valid_shapes() {
        assert!(validate_dn("").is_ok());
        assert!(validate_dn("cn=admin,dc=example,dc=org").is_ok());
        assert!(validate_dn("cn=a+sn=b,dc=x").is_ok());
        assert!(validate_dn("2.5.4.3=v,dc=x").is_ok());
        assert!(validate_dn("cn=doe\\, john,dc=x").is_ok());
    }

    #[test]
    fn dn_invalid_shapes() {
        assert!(validate_dn("no-equals-sign").is_err());
        assert!(validate_dn("cn=a,,dc=x").is_err());
        assert!(validate_dn("=v,dc=x").is_err());
        assert!(validate_dn("1cn=v").is_err());
        assert!(validate_dn("cn=trailing\\").is_err());
    }
}
