/// Environment key for a manifest field, e.g. `("server", "maxRequests")` -> `EDGESIM_SERVER_MAX_REQUESTS`.
pub fn env_key(section: &str, field: &str) -> String {
    format!("EDGESIM_{}_{}", to_env_key(section), to_env_key(field))
}

pub fn env_override(section: &str, field: &str) -> Option<String> {
    std::env::var(env_key(section, field))
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn to_env_key(name: &str) -> String {
    let mut out = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if matches!(ch, '_' | '-' | '.') {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
            continue;
        }
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        out.push(ch.to_ascii_uppercase());
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::env_key;

    #[test]
    fn derives_keys_from_snake_and_camel_case() {
        assert_eq!(env_key("server", "max_requests"), "EDGESIM_SERVER_MAX_REQUESTS");
        assert_eq!(env_key("server", "maxRequests"), "EDGESIM_SERVER_MAX_REQUESTS");
        assert_eq!(env_key("simulator", "ca-file"), "EDGESIM_SIMULATOR_CA_FILE");
    }
}
