//! Secret resolution.
//!
//! Contract: every secret is resolved once, here, at process startup. The
//! returned [`ResolvedSecrets`] is passed into constructors; callers never
//! scatter `std::env::var` calls across the codebase. `Debug` redacts every
//! value. Error messages name the env var, never its contents.

use anyhow::{bail, Result};

#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Upstream supplier GraphQL credentials. Required — there is no
    /// anonymous mode for the supplier adapter.
    pub upstream_username: String,
    pub upstream_password: String,
    /// Shared-secret header the operator HTTP surface checks on every
    /// request. Required.
    pub daemon_shared_secret: String,
    /// Durable queue connection string, when distinct from `database_url`
    /// (most deployments share one Postgres instance for both).
    pub queue_database_url: Option<String>,
    /// Alert sink webhook (ops notifications on run failure / stalled
    /// reapply). Optional — a missing value just means no alerts are sent.
    pub alert_webhook_url: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("upstream_username", &"<REDACTED>")
            .field("upstream_password", &"<REDACTED>")
            .field("daemon_shared_secret", &"<REDACTED>")
            .field(
                "queue_database_url",
                &self.queue_database_url.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "alert_webhook_url",
                &self.alert_webhook_url.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn require_env(var_name: &str) -> Result<String> {
    resolve_env(var_name)
        .ok_or_else(|| anyhow::anyhow!("SECRETS_MISSING: required env var '{var_name}' is not set or empty"))
}

/// Resolve all secrets from the environment. Called once by each
/// binary's `main` before constructing any component.
pub fn resolve_secrets() -> Result<ResolvedSecrets> {
    let upstream_username = require_env("UPSTREAM_USERNAME")?;
    let upstream_password = require_env("UPSTREAM_PASSWORD")?;
    let daemon_shared_secret = require_env("DAEMON_SHARED_SECRET")?;

    if upstream_username.trim().is_empty() || upstream_password.trim().is_empty() {
        bail!("SECRETS_MISSING: upstream credentials resolved but blank after trim");
    }

    Ok(ResolvedSecrets {
        upstream_username,
        upstream_password,
        daemon_shared_secret,
        queue_database_url: resolve_env("DIAMOND_QUEUE_DATABASE_URL"),
        alert_webhook_url: resolve_env("ALERT_WEBHOOK_URL"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_var_names_the_var_not_the_value() {
        std::env::remove_var("UPSTREAM_USERNAME");
        std::env::remove_var("UPSTREAM_PASSWORD");
        std::env::remove_var("DAEMON_SHARED_SECRET");
        let err = resolve_secrets().unwrap_err();
        assert!(err.to_string().contains("UPSTREAM_USERNAME"));
    }
}
