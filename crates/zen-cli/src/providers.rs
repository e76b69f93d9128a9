//! Builds provider instances from the integration config.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use zen_core::config::{IntegrationConfig, ProviderConfig};
use zen_core::credentials::{Credentials, EnvCredentials};
use zen_core::{Result, ZenError};
use zen_provider::adapters::jira::AuthType;
use zen_provider::adapters::{git, github, jira, GitProvider, GithubProvider, JiraProvider};
use zen_provider::{Discovery, Provider};
use zen_sync::SyncEngine;

/// Providers `zen` knows how to build.
pub const KNOWN: &[&str] = &[git::NAME, github::NAME, jira::NAME];

/// Names to instantiate: every configured section, the task system, and `git`.
pub fn wanted(config: &IntegrationConfig) -> BTreeSet<String> {
    let mut names: BTreeSet<String> = config.providers.keys().cloned().collect();
    if config.is_configured() {
        names.insert(config.task_system.clone());
    }
    names.insert(git::NAME.to_string());
    names
}

pub fn build(
    name: &str,
    section: &ProviderConfig,
    root: &Path,
    discovery: &Discovery,
    creds: Arc<dyn Credentials>,
) -> Result<Arc<dyn Provider>> {
    match name {
        git::NAME => Ok(Arc::new(GitProvider::discover(discovery)?.in_dir(root))),
        github::NAME => {
            let mut p = GithubProvider::discover(discovery)?
                .in_dir(root)
                .with_credentials(creds);
            if let Some(repo) = section.repo.as_deref() {
                p = p.with_repo(repo);
            }
            if !section.field_mappings.is_empty() {
                p = p.with_mapping(section.field_mappings.clone())?;
            }
            Ok(Arc::new(p))
        }
        jira::NAME => {
            let url = section
                .server_url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| {
                    ZenError::config("integration.providers.jira.server_url is not set")
                        .with_provider(jira::NAME)
                })?;
            let mut p = JiraProvider::new(url, creds)?
                .with_auth(AuthType::parse(section.auth_type.as_deref()));
            if let Some(key) = section.project_key.as_deref() {
                p = p.with_project(key);
            }
            if !section.field_mappings.is_empty() {
                p = p.with_mapping(section.field_mappings.clone())?;
            }
            Ok(Arc::new(p))
        }
        other => Err(ZenError::config(format!("unknown provider '{other}'"))
            .with_provider(other)
            .with_hint(format!("known providers: {}", KNOWN.join(", ")))),
    }
}

/// Register every wanted provider with `engine`. Providers that cannot be
/// built are skipped and returned with the reason.
pub fn register_all(
    engine: &SyncEngine,
    config: &IntegrationConfig,
    root: &Path,
) -> Vec<(String, ZenError)> {
    let discovery = Discovery::new();
    let creds: Arc<dyn Credentials> = Arc::new(EnvCredentials::from_env());
    let default_section = ProviderConfig::default();

    let mut skipped = Vec::new();
    for name in wanted(config) {
        let section = config.provider(&name).unwrap_or(&default_section);
        let built = build(&name, section, root, &discovery, creds.clone())
            .and_then(|p| engine.register_provider(p));
        match built {
            Ok(()) => debug!(provider = %name, "provider ready"),
            Err(e) => skipped.push((name, e)),
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_core::credentials::StaticCredentials;
    use zen_core::ErrorCode;

    #[test]
    fn wanted_includes_task_system_and_git() {
        let mut cfg = IntegrationConfig::default();
        assert_eq!(wanted(&cfg).into_iter().collect::<Vec<_>>(), vec!["git"]);
        cfg.task_system = "jira".into();
        cfg.providers.insert("github".into(), ProviderConfig::default());
        let names: Vec<String> = wanted(&cfg).into_iter().collect();
        assert_eq!(names, vec!["git", "github", "jira"]);
    }

    #[test]
    fn jira_requires_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::new());
        let err = build("jira", &ProviderConfig::default(), dir.path(), &Discovery::new(), creds)
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::ConfigError);
    }

    #[test]
    fn jira_builds_from_section() {
        let dir = tempfile::tempdir().unwrap();
        let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::new().with_token("jira", "t"));
        let section = ProviderConfig {
            server_url: Some("https://example.atlassian.net".into()),
            project_key: Some("ZEN".into()),
            auth_type: Some("basic".into()),
            ..Default::default()
        };
        let p = build("jira", &section, dir.path(), &Discovery::new(), creds).unwrap();
        assert_eq!(p.name(), "jira");
        assert!(p.as_task_provider().is_some());
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let creds: Arc<dyn Credentials> = Arc::new(StaticCredentials::new());
        let err = build("trello", &ProviderConfig::default(), dir.path(), &Discovery::new(), creds)
            .err()
            .unwrap();
        assert_eq!(err.code, ErrorCode::ConfigError);
        assert!(err.hint.unwrap().contains("jira"));
    }
}
