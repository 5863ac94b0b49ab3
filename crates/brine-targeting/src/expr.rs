//! Exact / glob / regex expression matching.

use regex::Regex;

/// Translate a shell glob into an anchored regex.
///
/// `*` and `?` match any character including `/`; `[...]` is a character
/// class and `[!...]` its negation. An unterminated `[` is a literal.
pub fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from(r"\A(?s:");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str(r"\[");
                } else {
                    let mut class: String = chars[i + 1..j].iter().collect();
                    class = class.replace('\\', r"\\").replace('[', r"\[");
                    out.push('[');
                    if let Some(rest) = class.strip_prefix('!') {
                        out.push('^');
                        out.push_str(rest);
                    } else if let Some(rest) = class.strip_prefix('^') {
                        out.push_str(r"\^");
                        out.push_str(rest);
                    } else {
                        out.push_str(&class);
                    }
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push_str(r")\z");
    out
}

pub fn glob_match(value: &str, pattern: &str) -> bool {
    if !pattern.contains(['*', '?', '[']) {
        return value == pattern;
    }
    Regex::new(&glob_to_regex(pattern))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Full-string match, else glob, else anchored regex. An invalid regex
/// simply does not match.
pub fn expr_match(value: &str, expr: &str) -> bool {
    if value == expr || glob_match(value, expr) {
        return true;
    }
    Regex::new(&format!(r"\A(?:{})\z", expr))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Blacklist first (any match refuses), then whitelist (empty allows all).
pub fn check_whitelist_blacklist<S: AsRef<str>>(
    value: &str,
    whitelist: &[S],
    blacklist: &[S],
) -> bool {
    if blacklist.iter().any(|expr| expr_match(value, expr.as_ref())) {
        return false;
    }
    if whitelist.is_empty() {
        return true;
    }
    whitelist.iter().any(|expr| expr_match(value, expr.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translation() {
        assert!(glob_match("web01", "web*"));
        assert!(glob_match("web01", "web0?"));
        assert!(glob_match("web1", "web[0-9]"));
        assert!(!glob_match("webx", "web[0-9]"));
        assert!(glob_match("webx", "web[!0-9]"));
        assert!(glob_match("a.b", "a.b"));
        assert!(!glob_match("axb", "a.b"));
        assert!(glob_match("dir/file", "dir*"));
        assert!(glob_match("x[", "x["));
        assert!(!glob_match("web01", "db*"));
    }

    #[test]
    fn expr_match_order() {
        // exact
        assert!(expr_match("base", "base"));
        // glob
        assert!(expr_match("feature-x", "feature-*"));
        // regex, anchored on both ends
        assert!(expr_match("dev42", r"dev\d+"));
        assert!(!expr_match("xdev42", r"dev\d+"));
        // broken regex just fails
        assert!(!expr_match("a", "(unclosed"));
    }

    #[test]
    fn blacklist_wins() {
        let white = ["base", "dev*"];
        let black = ["dev-secret"];
        assert!(check_whitelist_blacklist("base", &white, &black));
        assert!(check_whitelist_blacklist("dev1", &white, &black));
        assert!(!check_whitelist_blacklist("dev-secret", &white, &black));
        assert!(!check_whitelist_blacklist("prod", &white, &black));

        let none: [&str; 0] = [];
        assert!(check_whitelist_blacklist("prod", &none, &none));
        assert!(!check_whitelist_blacklist("prod", &none, &["prod"]));
    }
}
