//! Page environment and plugin construction context

use crate::cookie::{CookieJar, MemoryCookieJar};
use crate::data::GlobalData;
use crate::metadata::{HtmlDocument, MetadataSource};
use crate::orchestrator::DataLayerRef;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Collaborators the data layer needs from the page
#[derive(Clone)]
pub struct Environment {
    /// Page cookies
    pub cookies: Arc<dyn CookieJar>,
    /// The document carrying metadata markup
    pub document: Arc<dyn MetadataSource>,
    /// Location query string, with or without the leading `?`
    pub query: String,
    /// Browser user agent
    pub user_agent: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            cookies: Arc::new(MemoryCookieJar::new()),
            document: Arc::new(HtmlDocument::empty()),
            query: String::new(),
            user_agent: String::new(),
        }
    }
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(mut self, cookies: Arc<dyn CookieJar>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_document(mut self, document: Arc<dyn MetadataSource>) -> Self {
        self.document = document;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Decoded query parameters in order of appearance
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        url::form_urlencoded::parse(self.query.trim_start_matches('?').as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    /// First value of the query parameter `name`
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("query", &self.query)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

/// Everything a plugin receives at construction
#[derive(Clone)]
pub struct PluginContext {
    id: String,
    layer: DataLayerRef,
    data: GlobalData,
    config: Value,
    environment: Environment,
}

impl PluginContext {
    pub(crate) fn new(
        id: impl Into<String>,
        layer: DataLayerRef,
        data: GlobalData,
        config: Value,
        environment: Environment,
    ) -> Self {
        Self {
            id: id.into(),
            layer,
            data,
            config,
            environment,
        }
    }

    /// Id the plugin was requested under
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-owning handle back to the data layer
    pub fn layer(&self) -> &DataLayerRef {
        &self.layer
    }

    /// The shared global data
    pub fn data(&self) -> &GlobalData {
        &self.data
    }

    /// Plugin-specific configuration, `{}` when none was supplied
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params() {
        let env = Environment::new().with_query("?emsrc=newsletter&refId=a%20b&x=1&x=2");
        assert_eq!(env.query_param("emsrc").as_deref(), Some("newsletter"));
        assert_eq!(env.query_param("refId").as_deref(), Some("a b"));
        assert_eq!(env.query_param("x").as_deref(), Some("1"));
        assert_eq!(env.query_param("missing"), None);
    }
}
