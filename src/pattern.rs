//! Pattern matching and priority ranking over resource names.
//!
//! A pattern is a literal, a `*`-glob, or a comma-separated list of globs.
//! `*` matches any substring, including `/`. Matching is case-sensitive and
//! does no I/O, so it can be called freely from the request hot path.

/// Priority rank for a pattern. Lower is stronger (wins ties in resolution).
pub fn priority(pattern: &str) -> u8 {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return 5;
    }
    if pattern.contains(',') {
        return 4;
    }
    if !pattern.contains('*') {
        return 1;
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return if leading_segment_count(prefix) >= 3 { 2 } else { 3 };
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return if leading_segment_count(prefix) >= 3 { 2 } else { 5 };
    }
    5
}

/// Length of the literal prefix before the first wildcard or comma.
/// Used to break priority ties: the longer literal prefix wins.
pub fn literal_prefix_len(pattern: &str) -> usize {
    let pattern = pattern.trim();
    pattern.find(['*', ',']).unwrap_or(pattern.len())
}

fn leading_segment_count(prefix: &str) -> usize {
    prefix.split('/').filter(|s| !s.is_empty()).count()
}

/// True iff `resource` matches any sub-pattern of `pattern` (comma-separated
/// globs). Empty patterns never match. Sub-patterns are trimmed before use.
pub fn matches(resource: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    pattern.split(',').any(|sub| glob_match(resource, sub.trim()))
}

fn glob_match(resource: &str, sub: &str) -> bool {
    if sub.is_empty() {
        return false;
    }
    if sub == "*" {
        return true;
    }
    // A pattern ending in "/*" additionally requires the resource to carry
    // at least one character past the separating slash — "/api/" alone
    // (with nothing after the slash) does not match "/api/*".
    if let Some(prefix) = sub.strip_suffix('*') {
        if prefix.ends_with('/') {
            return resource.starts_with(prefix) && resource.len() > prefix.len();
        }
    }
    wildcard_match(resource.as_bytes(), sub.as_bytes())
}

/// Classic greedy `*`-only wildcard matcher (no `?`). `*` may match the
/// empty string or any run of characters, including `/`.
fn wildcard_match(s: &[u8], p: &[u8]) -> bool {
    let (mut si, mut pi) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut match_from = 0usize;

    while si < s.len() {
        if pi < p.len() && (p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            match_from = si;
            pi += 1;
        } else if let Some(st) = star {
            pi = st + 1;
            match_from += 1;
            si = match_from;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Is this a syntactically valid, non-empty pattern? Used by the rule
/// registry to reject `InvalidPattern` at rule-add time.
pub fn is_valid(pattern: &str) -> bool {
    !pattern.trim().is_empty() && pattern.split(',').all(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_priority() {
        assert_eq!(priority("/health"), 1);
        assert_eq!(priority("/api/v1/users/profile"), 1);
    }

    #[test]
    fn specific_glob_priority() {
        assert_eq!(priority("/api/v1/auth/*"), 2);
    }

    #[test]
    fn shallow_glob_priority() {
        assert_eq!(priority("/api/*"), 3);
        assert_eq!(priority("/prefix/*"), 3);
    }

    #[test]
    fn multi_pattern_priority() {
        assert_eq!(
            priority("/grpc/*/get*,/grpc/*/list*,/grpc/*/find*"),
            4
        );
    }

    #[test]
    fn star_alone_is_other() {
        assert_eq!(priority("*"), 5);
        assert!(matches("/anything/at/all", "*"));
    }

    #[test]
    fn empty_pattern_never_matches() {
        assert!(!matches("/health", ""));
        assert_eq!(priority(""), 5);
    }

    #[test]
    fn shallow_glob_requires_trailing_segment() {
        assert!(matches("/api/v1/users", "/api/*"));
        assert!(!matches("/api/", "/api/*"));
        assert!(!matches("/api", "/api/*"));
    }

    #[test]
    fn multi_pattern_matches_any_sub_glob() {
        assert!(matches("/grpc/user_service/get_user", "/grpc/*/get*,/grpc/*/list*"));
        assert!(matches("/grpc/order_service/list_orders", "/grpc/*/get*,/grpc/*/list*"));
        assert!(!matches("/grpc/order_service/delete_order", "/grpc/*/get*,/grpc/*/list*"));
    }

    #[test]
    fn whitespace_is_trimmed_around_sub_patterns() {
        assert!(matches("/a", " /a , /b "));
    }

    #[test]
    fn case_sensitive() {
        assert!(!matches("/Health", "/health"));
    }

    #[test]
    fn literal_prefix_len_ties() {
        assert_eq!(literal_prefix_len("/api/v1/auth/*"), "/api/v1/auth/".len());
        assert_eq!(literal_prefix_len("/api/*"), "/api/".len());
        assert_eq!(literal_prefix_len("/health"), "/health".len());
    }
}
