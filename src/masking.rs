use secrecy::{ExposeSecret, SecretString};

const REDACTED: &str = "[REDACTED]";

/// Log-safe rendering of a credential. Clear text only with `--show-secrets`.
pub fn format_secret(secret: &SecretString, show_secrets: bool) -> String {
    match show_secrets {
        true => secret.expose_secret().to_owned(),
        false => REDACTED.to_owned(),
    }
}
