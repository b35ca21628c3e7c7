/// Validates an email address against the simple `local@domain.tld` shape.
///
/// A valid address has:
/// - exactly one `@`
/// - a non-empty local part
/// - a domain containing a `.` with characters on both sides
/// - no whitespace anywhere
#[must_use]
pub fn is_valid_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}
