//! Client profile templates
//!
//! Two templates exist: `client.conf` references the certificate and key by
//! filename, `client-inline.conf` embeds CA, certificate and key as PEM text.
//! Operators can override either by dropping a file with the same name into
//! the configured templates directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};

const BUILTIN_CLIENT_CONF: &str = include_str!("../templates/client.conf.j2");
const BUILTIN_CLIENT_INLINE_CONF: &str = include_str!("../templates/client-inline.conf.j2");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileTemplate {
    /// References `ca.crt`, `<id>.crt` and `<id>.key` by name
    Bundled,
    /// Self-contained profile with PEM material inline
    Inline,
}

impl ProfileTemplate {
    pub fn name(&self) -> &'static str {
        match self {
            ProfileTemplate::Bundled => "client.conf",
            ProfileTemplate::Inline => "client-inline.conf",
        }
    }
}

pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template: ProfileTemplate,
        vars: &BTreeMap<String, String>,
    ) -> std::result::Result<String, minijinja::Error>;
}

pub struct MinijinjaRenderer {
    env: Environment<'static>,
    client_conf: String,
    client_inline_conf: String,
}

impl Default for MinijinjaRenderer {
    fn default() -> Self {
        Self::with_sources(BUILTIN_CLIENT_CONF, BUILTIN_CLIENT_INLINE_CONF)
    }
}

impl MinijinjaRenderer {
    pub fn with_sources(
        client_conf: impl Into<String>,
        client_inline_conf: impl Into<String>,
    ) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self {
            env,
            client_conf: client_conf.into(),
            client_inline_conf: client_inline_conf.into(),
        }
    }

    /// Built-in templates, each replaced by `<dir>/<name>` when that file exists.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let load = |template: ProfileTemplate, builtin: &str| -> Result<String> {
            let path = dir.join(template.name());
            if path.exists() {
                fs::read_to_string(&path)
                    .context(format!("Failed to read template {}", path.display()))
            } else {
                Ok(builtin.to_string())
            }
        };
        Ok(Self::with_sources(
            load(ProfileTemplate::Bundled, BUILTIN_CLIENT_CONF)?,
            load(ProfileTemplate::Inline, BUILTIN_CLIENT_INLINE_CONF)?,
        ))
    }

    pub fn from_optional_dir(dir: Option<&Path>) -> Result<Self> {
        match dir {
            Some(dir) => Self::from_dir(dir),
            None => Ok(Self::default()),
        }
    }
}

impl TemplateRenderer for MinijinjaRenderer {
    fn render(
        &self,
        template: ProfileTemplate,
        vars: &BTreeMap<String, String>,
    ) -> std::result::Result<String, minijinja::Error> {
        let source = match template {
            ProfileTemplate::Bundled => &self.client_conf,
            ProfileTemplate::Inline => &self.client_inline_conf,
        };
        self.env.render_str(source, vars)
    }
}
