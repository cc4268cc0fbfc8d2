/// Replace `${ENV_VAR}` and `${ENV_VAR:-fallback}` placeholders in the raw
/// config text before it is parsed.
///
/// Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

/// Same as [`substitute_env`] with a custom lookup, so tests never touch the
/// process environment.
fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder: keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };

        let inner = &after[..end];
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (inner, None),
        };

        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(value), _) => out.push_str(&value),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(inner);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "PARLEY_TEST_SECRET" => Some("s3cret".to_string()),
            _ => None,
        }
    }

    #[test]
    fn replaces_known_variable() {
        assert_eq!(
            substitute_env_with("secret = \"${PARLEY_TEST_SECRET}\"", lookup),
            "secret = \"s3cret\""
        );
    }

    #[test]
    fn keeps_unknown_variable() {
        assert_eq!(
            substitute_env_with("${PARLEY_MISSING_XYZ}", lookup),
            "${PARLEY_MISSING_XYZ}"
        );
    }

    #[test]
    fn uses_fallback_when_unset() {
        assert_eq!(
            substitute_env_with("port = ${PARLEY_MISSING_PORT:-3000}", lookup),
            "port = 3000"
        );
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env_with("a ${oops", lookup), "a ${oops");
    }

    #[test]
    fn multiple_placeholders() {
        assert_eq!(
            substitute_env_with("${PARLEY_TEST_SECRET}-${PARLEY_TEST_SECRET}", lookup),
            "s3cret-s3cret"
        );
    }
}
