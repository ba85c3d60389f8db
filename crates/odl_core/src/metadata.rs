//! Metadata markup collection from the page document
//!
//! Page code declares data and events through `<meta name="odl:..." content="{json}">`
//! tags. A [`MetadataSource`] exposes those tags; [`collect_metadata`] parses
//! and deep-merges them.

use crate::error::DataLayerError;
use crate::utils::extend;
use crate::Result;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error};

/// Prefix of every metadata tag name
pub const META_PREFIX: &str = "odl:";

/// Marker set on event tags once they have been broadcast
pub const HANDLED_EVENT_MARKER: &str = "data-odl-handled-event";

/// Full tag name for a metadata kind, e.g. `odl:data`
pub fn meta_name(kind: &str) -> String {
    format!("{}{}", META_PREFIX, kind)
}

/// One metadata tag found in the document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTag {
    /// Value of the `name` attribute
    pub name: String,
    /// Position among all tags with this name in document order
    pub index: usize,
    /// Raw `content` attribute
    pub content: Option<String>,
}

/// Source of metadata tags
pub trait MetadataSource: Send + Sync + 'static {
    /// Tags named `name` in document order, limited to the first element
    /// matching the CSS selector `context` when given. `None` when the
    /// context does not exist.
    fn meta_tags(&self, name: &str, context: Option<&str>) -> Option<Vec<MetaTag>>;

    /// Attach `marker` to a tag
    fn mark_handled(&self, tag: &MetaTag, marker: &str);

    fn is_handled(&self, tag: &MetaTag, marker: &str) -> bool;
}

/// An HTML document held as source text
#[derive(Debug, Default)]
pub struct HtmlDocument {
    source: RwLock<String>,
    markers: RwLock<HashSet<(String, usize, String)>>,
}

impl HtmlDocument {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: RwLock::new(source.into()),
            markers: RwLock::new(HashSet::new()),
        }
    }

    /// A document without any markup
    pub fn empty() -> Self {
        Self::default()
    }

    /// Insert a fragment at the end of the body, as page code does when it
    /// renders new markup after load
    pub fn append_html(&self, fragment: &str) {
        let mut source = self.source.write().unwrap_or_else(PoisonError::into_inner);
        match source.rfind("</body>") {
            Some(pos) => source.insert_str(pos, fragment),
            None => source.push_str(fragment),
        }
    }

    /// Current source text
    pub fn source(&self) -> String {
        self.source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn named_meta<'a>(root: ElementRef<'a>, selector: &Selector, name: &str) -> Vec<ElementRef<'a>> {
    root.select(selector)
        .filter(|el| el.value().attr("name") == Some(name))
        .collect()
}

impl MetadataSource for HtmlDocument {
    fn meta_tags(&self, name: &str, context: Option<&str>) -> Option<Vec<MetaTag>> {
        let source = self.source();
        let html = Html::parse_document(&source);
        let meta = Selector::parse("meta[name]").ok()?;
        let all = named_meta(html.root_element(), &meta, name);

        let scoped = match context {
            None => all.clone(),
            Some(selector) => {
                let selector = match Selector::parse(selector) {
                    Ok(selector) => selector,
                    Err(e) => {
                        debug!("Invalid context selector '{}': {:?}", selector, e);
                        return None;
                    }
                };
                let parent = html.select(&selector).next()?;
                named_meta(parent, &meta, name)
            }
        };

        let tags = scoped
            .iter()
            .filter_map(|el| {
                let index = all.iter().position(|other| other.id() == el.id())?;
                Some(MetaTag {
                    name: name.to_string(),
                    index,
                    content: el.value().attr("content").map(str::to_string),
                })
            })
            .collect();
        Some(tags)
    }

    fn mark_handled(&self, tag: &MetaTag, marker: &str) {
        self.markers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((tag.name.clone(), tag.index, marker.to_string()));
    }

    fn is_handled(&self, tag: &MetaTag, marker: &str) -> bool {
        self.markers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(tag.name.clone(), tag.index, marker.to_string()))
    }
}

/// Collect and deep-merge every `name` tag into `seed`.
///
/// `on_item` sees each parsed tag after it was merged. A tag that fails to
/// parse is reported through `on_item` as an error and stops the scan; tags
/// merged before it are kept. A missing context is logged and returned as
/// [`DataLayerError::ContextNotFound`].
pub fn collect_metadata<F>(
    source: &dyn MetadataSource,
    name: &str,
    context: Option<&str>,
    seed: Value,
    mut on_item: F,
) -> Result<Value>
where
    F: FnMut(Result<(&MetaTag, &Value)>),
{
    let Some(tags) = source.meta_tags(name, context) else {
        let err = DataLayerError::ContextNotFound(context.unwrap_or_default().to_string());
        error!("❌ {}", err);
        return Err(err);
    };

    let mut data = seed;
    for tag in &tags {
        let parsed = match tag.content.as_deref() {
            Some(content) => serde_json::from_str::<Value>(content)
                .map_err(|e| DataLayerError::MetadataParse(e.to_string())),
            None => Err(DataLayerError::MetadataParse(
                "missing content attribute".to_string(),
            )),
        };
        match parsed {
            Ok(value) => {
                extend(&mut data, &value);
                on_item(Ok((tag, &value)));
            }
            Err(e) => {
                on_item(Err(e));
                break;
            }
        }
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"<!DOCTYPE html>
<html><head>
<meta name="odl:data" content='{"page":{"type":"home"}}'>
<meta name="description" content="ignored">
</head><body>
<div id="teaser">
  <meta name="odl:data" content='{"page":{"name":"Home"},"tags":[1,2]}'>
</div>
<meta name="odl:data" content='{"tags":[3]}'>
</body></html>"#;

    #[test]
    fn test_collects_and_merges_in_order() {
        let doc = HtmlDocument::new(PAGE);
        let mut seen = Vec::new();
        let data = collect_metadata(&doc, "odl:data", None, json!({}), |item| {
            let (tag, _) = item.unwrap();
            seen.push(tag.index);
        })
        .unwrap();
        assert_eq!(seen, [0, 1, 2]);
        assert_eq!(data, json!({"page": {"type": "home", "name": "Home"}, "tags": [3]}));
    }

    #[test]
    fn test_context_limits_lookup() {
        let doc = HtmlDocument::new(PAGE);
        let tags = doc.meta_tags("odl:data", Some("#teaser")).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].index, 1);
    }

    #[test]
    fn test_missing_context() {
        let doc = HtmlDocument::new(PAGE);
        let result = collect_metadata(&doc, "odl:data", Some("#nope"), json!({}), |_| {});
        assert_eq!(
            result,
            Err(DataLayerError::ContextNotFound("#nope".to_string()))
        );
    }

    #[test]
    fn test_parse_error_stops_and_keeps_earlier_items() {
        let doc = HtmlDocument::new(
            r#"<html><body>
<meta name="odl:data" content='{"a":1}'>
<meta name="odl:data" content='{broken'>
<meta name="odl:data" content='{"c":3}'>
</body></html>"#,
        );
        let mut errors = 0;
        let mut items = 0;
        let data = collect_metadata(&doc, "odl:data", None, json!({"seed": true}), |item| match item {
            Ok(_) => items += 1,
            Err(DataLayerError::MetadataParse(_)) => errors += 1,
            Err(other) => panic!("unexpected error {other}"),
        })
        .unwrap();
        assert_eq!((items, errors), (1, 1));
        assert_eq!(data, json!({"seed": true, "a": 1}));
    }

    #[test]
    fn test_handled_markers_and_appended_markup() {
        let doc = HtmlDocument::new("<html><body></body></html>");
        assert!(doc.meta_tags("odl:event", None).unwrap().is_empty());

        doc.append_html(r#"<meta name="odl:event" content='{"name":"view"}'>"#);
        let tags = doc.meta_tags("odl:event", None).unwrap();
        assert_eq!(tags.len(), 1);
        assert!(!doc.is_handled(&tags[0], HANDLED_EVENT_MARKER));
        doc.mark_handled(&tags[0], HANDLED_EVENT_MARKER);
        assert!(doc.is_handled(&tags[0], HANDLED_EVENT_MARKER));
    }
}
