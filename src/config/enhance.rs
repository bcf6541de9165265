/// Expand `$NAME`, `${NAME}` and `${NAME:-fallback}` references in a config
/// document. Undefined variables expand to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(body) = after.strip_prefix('{') {
            match body.find('}') {
                Some(end) => {
                    out.push_str(&lookup(&body[..end]));
                    rest = &body[end + 1..];
                }
                None => {
                    // unterminated, keep verbatim
                    out.push_str(&rest[pos..]);
                    rest = "";
                }
            }
            continue;
        }

        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len == 0 {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&after[..len]).unwrap_or_default());
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}

fn lookup(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, fallback)) => match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => fallback.to_string(),
        },
        None => std::env::var(expr).unwrap_or_default(),
    }
}
