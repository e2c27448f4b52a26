//! Shared utilities for fnbench.

/// Key fragments whose values are never logged.
const SENSITIVE_KEYS: &[&str] = &["SECRET", "TOKEN", "PASSWORD", "API_KEY", "APIKEY", "AUTH"];

/// Flags whose following argument is a secret.
const SENSITIVE_FLAGS: &[&str] = &["--token", "--password", "--api-key", "--secret"];

fn is_sensitive_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SENSITIVE_KEYS.iter().any(|k| upper.contains(k))
}

/// Mask `KEY=value` pairs with a sensitive key inside one argument.
///
/// Handles comma-separated lists such as `--set-env-vars=A=1,SECRET=x`.
fn mask_arg(arg: &str) -> String {
    if let Some((flag, value)) = arg.split_once('=')
        && flag.starts_with("--")
    {
        if SENSITIVE_FLAGS.contains(&flag) {
            return format!("{flag}=***");
        }
        if value.contains('=') {
            return format!("{flag}={}", mask_pairs(value));
        }
        return arg.to_string();
    }
    mask_pairs(arg)
}

fn mask_pairs(list: &str) -> String {
    list.split(',')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if is_sensitive_key(key) => format!("{key}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Render an argv for logging with secret values replaced by `***`.
pub fn mask_sensitive_args<S: AsRef<str>>(argv: &[S]) -> String {
    let mut out = Vec::with_capacity(argv.len());
    let mut mask_next = false;
    for arg in argv {
        let arg = arg.as_ref();
        if mask_next {
            out.push("***".to_string());
            mask_next = false;
            continue;
        }
        if SENSITIVE_FLAGS.contains(&arg) {
            mask_next = true;
            out.push(arg.to_string());
            continue;
        }
        out.push(mask_arg(arg));
    }
    out.join(" ")
}

/// Show only enough of a secret to tell two apart.
pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(2).collect();
    if secret.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

/// Cut `s` to at most `max` characters for log output.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    if trimmed.chars().count() <= max {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max).collect();
    format!("{cut}...")
}
