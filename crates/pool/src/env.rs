use std::collections::BTreeMap;

/// Variables stripped wholesale from the child environment.
const SENSITIVE_EXACT: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "CLAUDE_API_KEY",
    "DISCORD_TOKEN",
    "DISCORD_BOT_TOKEN",
    "TELEGRAM_BOT_TOKEN",
    "SLACK_BOT_TOKEN",
    "SLACK_SIGNING_SECRET",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "NPM_TOKEN",
    "MOLTBOT_OAUTH_DIR",
];

/// Name suffixes that mark a variable as credential-bearing.
const SENSITIVE_SUFFIXES: &[&str] = &[
    "_TOKEN",
    "_SECRET",
    "_API_KEY",
    "_PASSWORD",
    "_PRIVATE_KEY",
];

/// Case-insensitive check against the deny list. Children must never inherit
/// credential state from the supervisor; the sandbox overlay re-adds the
/// variables a worker is supposed to see.
pub fn is_sensitive_env(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_EXACT.contains(&upper.as_str())
        || SENSITIVE_SUFFIXES
            .iter()
            .any(|suffix| upper.ends_with(suffix))
}

/// The supervisor's own environment minus every sensitive variable.
pub fn filtered_parent_env() -> BTreeMap<String, String> {
    filter_env(std::env::vars())
}

pub fn filter_env(
    vars: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter(|(name, _)| !is_sensitive_env(name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_are_stripped_case_insensitively() {
        assert!(is_sensitive_env("ANTHROPIC_API_KEY"));
        assert!(is_sensitive_env("anthropic_api_key"));
        assert!(is_sensitive_env("Discord_Token"));
        assert!(is_sensitive_env("MOLTBOT_OAUTH_DIR"));
    }

    #[test]
    fn suffix_patterns_catch_arbitrary_prefixes() {
        assert!(is_sensitive_env("FOO_TOKEN"));
        assert!(is_sensitive_env("my_password"));
        assert!(is_sensitive_env("CI_DEPLOY_SECRET"));
        assert!(is_sensitive_env("SSH_PRIVATE_KEY"));
        assert!(is_sensitive_env("VENDOR_API_KEY"));
    }

    #[test]
    fn benign_variables_pass_through() {
        assert!(!is_sensitive_env("PATH"));
        assert!(!is_sensitive_env("HOME"));
        assert!(!is_sensitive_env("LANG"));
        assert!(!is_sensitive_env("TOKENIZER"));
        assert!(!is_sensitive_env("SECRETARY"));
    }

    #[test]
    fn filter_env_drops_only_sensitive_entries() {
        let filtered = filter_env([
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("ANTHROPIC_API_KEY".to_owned(), "sk-x".to_owned()),
            ("FOO_TOKEN".to_owned(), "t".to_owned()),
            ("MY_PASSWORD".to_owned(), "p".to_owned()),
            ("EDITOR".to_owned(), "vi".to_owned()),
        ]);
        assert_eq!(filtered.len(), 2);
        assert!(filtered.contains_key("PATH"));
        assert!(filtered.contains_key("EDITOR"));
    }

    #[test]
    fn sandbox_overlay_wins_over_the_filtered_parent() {
        let mut env = filter_env([
            ("HOME".to_owned(), "/home/host".to_owned()),
            ("ANTHROPIC_API_KEY".to_owned(), "sk-x".to_owned()),
        ]);
        env.extend([("HOME".to_owned(), "/sandbox/worker-0".to_owned())]);
        assert_eq!(env["HOME"], "/sandbox/worker-0");
        assert!(!env.contains_key("ANTHROPIC_API_KEY"));
    }
}
