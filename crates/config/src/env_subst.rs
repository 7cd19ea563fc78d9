/// Expand `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// Unset variables without a fallback are left as-is so the parse error (or
/// the literal value) points at the missing variable.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder verbatim.
            out.push_str(&rest[start..]);
            return out;
        };
        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        match (name.is_empty(), lookup(name), fallback) {
            (false, Some(val), _) => out.push_str(&val),
            (false, None, Some(fallback)) => out.push_str(fallback),
            _ => {
                out.push_str("${");
                out.push_str(expr);
                out.push('}');
            },
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
