//! Shape checks for the global data passed to `initialize`

use crate::error::DataLayerError;
use crate::utils::truthy_at;
use crate::Result;
use serde_json::Value;

/// Check that `data` carries the mandatory page, site and user entries.
///
/// `user` may be an empty object but must be present.
pub fn validate_global_data(data: &Value) -> Result<()> {
    if !data.is_object() {
        return Err(DataLayerError::MissingGlobalData);
    }
    if !truthy_at(data, "page.type") || !truthy_at(data, "page.name") {
        return Err(DataLayerError::InvalidPageData);
    }
    if !truthy_at(data, "site.id") {
        return Err(DataLayerError::InvalidSiteData);
    }
    if !truthy_at(data, "user") {
        return Err(DataLayerError::InvalidUserData);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_data() {
        let data = json!({"page": {"type": "home", "name": "Home"}, "site": {"id": "s1"}, "user": {}});
        assert_eq!(validate_global_data(&data), Ok(()));
    }

    #[test]
    fn test_missing_pieces() {
        assert_eq!(validate_global_data(&Value::Null), Err(DataLayerError::MissingGlobalData));
        assert_eq!(
            validate_global_data(&json!({"page": {"type": "home"}, "site": {"id": "s1"}, "user": {}})),
            Err(DataLayerError::InvalidPageData)
        );
        assert_eq!(
            validate_global_data(&json!({"page": {"type": "", "name": "Home"}, "site": {"id": "s1"}, "user": {}})),
            Err(DataLayerError::InvalidPageData)
        );
        assert_eq!(
            validate_global_data(&json!({"page": {"type": "home", "name": "Home"}, "site": {}, "user": {}})),
            Err(DataLayerError::InvalidSiteData)
        );
        assert_eq!(
            validate_global_data(&json!({"page": {"type": "home", "name": "Home"}, "site": {"id": "s1"}})),
            Err(DataLayerError::InvalidUserData)
        );
    }
}
