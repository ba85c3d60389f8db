//! Error types for the data layer

/// Main error type for the data layer
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataLayerError {
    /// `initialize` was called without any global data
    #[error("No global data supplied")]
    MissingGlobalData,

    /// `page.type` or `page.name` is missing
    #[error("Supplied page data is invalid or missing")]
    InvalidPageData,

    /// `site.id` is missing
    #[error("Supplied site data is invalid or missing")]
    InvalidSiteData,

    /// `user` is missing
    #[error("Supplied user data is invalid or missing")]
    InvalidUserData,

    /// The loader could not resolve a plugin module
    #[error("Plugin loading failed for '{id}': {reason}")]
    PluginLoadFailed { id: String, reason: String },

    /// No module is known for the requested plugin id
    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    /// The plugin constructor rejected its data or configuration
    #[error("Plugin construction failed for '{id}': {reason}")]
    PluginConstructionFailed { id: String, reason: String },

    /// A plugin failed while handling an event
    #[error("Plugin '{id}' failed to handle event '{event}': {reason}")]
    EventHandlingFailed { id: String, event: String, reason: String },

    /// The lookup context for a metadata scan does not exist
    #[error("collectMetadata: context with selector \"{0}\" not found")]
    ContextNotFound(String),

    /// A metadata tag did not carry valid JSON
    #[error("collectMetadata: parse error {0}")]
    MetadataParse(String),

    /// A queued command named a method the data layer does not expose
    #[error("method \"{0}\" not found in data layer")]
    UnknownMethod(String),

    /// A queued command had malformed arguments
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DataLayerError {
    fn from(err: serde_json::Error) -> Self {
        DataLayerError::Serialization(err.to_string())
    }
}

impl DataLayerError {
    /// Returns true for the precondition violations raised by `initialize`
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DataLayerError::MissingGlobalData
                | DataLayerError::InvalidPageData
                | DataLayerError::InvalidSiteData
                | DataLayerError::InvalidUserData
        )
    }
}
