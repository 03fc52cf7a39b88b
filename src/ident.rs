//! TSDL identifier rules.
//!
//! CTF 1.8 reserves a set of keywords and the `_` prefix; names that
//! collide are "protected" by prepending a single `_`.

/// Keywords that TSDL reserves; none of these may appear bare as a
/// structure member, variant option, clock, or environment entry name.
pub(crate) const RESERVED_TSDL_KEYWORDS: &[&str] = &[
    "align",
    "callsite",
    "const",
    "char",
    "clock",
    "double",
    "enum",
    "env",
    "event",
    "floating_point",
    "float",
    "integer",
    "int",
    "long",
    "short",
    "signed",
    "stream",
    "string",
    "struct",
    "trace",
    "typealias",
    "typedef",
    "unsigned",
    "variant",
    "void",
    "_Bool",
    "_Complex",
    "_Imaginary",
];

/// Returns true if `name` is a valid TSDL identifier: non-empty, not a
/// reserved keyword, starts with an ASCII letter or `_`, and contains
/// only ASCII alphanumerics and `_`.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    if RESERVED_TSDL_KEYWORDS.contains(&name) {
        return false;
    }

    let mut chars = name.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    if !first.is_ascii_alphabetic() && first != '_' {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns true if `name` must be protected with a leading `_`: it is
/// a reserved keyword, or it already starts with `_` (so that the
/// unprotected presentation form stays unambiguous).
pub(crate) fn must_protect_identifier(name: &str) -> bool {
    RESERVED_TSDL_KEYWORDS.contains(&name) || name.starts_with('_')
}

/// Protection step that carries the "was already protected" state so
/// that protection is applied at most once per source name. Returns
/// the (possibly protected) name and the updated state.
pub(crate) fn protect_name(name: &str, already_protected: bool) -> (String, bool) {
    if !already_protected && must_protect_identifier(name) {
        (format!("_{name}"), true)
    } else {
        (name.to_owned(), already_protected)
    }
}

/// Returns true if `name` matches `reserved_name` either bare or in
/// its protected (`_`-prefixed) form.
pub(crate) fn is_reserved_member_name(name: &str, reserved_name: &str) -> bool {
    name == reserved_name
        || (name.as_bytes().first() == Some(&b'_') && &name[1..] == reserved_name)
}
