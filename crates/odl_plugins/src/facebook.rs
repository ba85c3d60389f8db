//! Facebook website custom audience pixel

use crate::plugin_config;
use crate::sink::{TrackerCall, TrackerSink};
use odl_core::{Event, Plugin, PluginContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

const TRACKER: &str = "_fbq";
const SCRIPT: &str = "//connect.facebook.net/en_US/fbds.js";

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookConfig {
    pub pixel_id: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

pub struct FacebookWca {
    sink: Arc<dyn TrackerSink>,
}

impl FacebookWca {
    pub fn new(ctx: &PluginContext, sink: Arc<dyn TrackerSink>) -> odl_core::Result<Self> {
        let config: FacebookConfig = plugin_config(ctx)?;
        info!("👥 Facebook WCA: initializing pixel {}", config.pixel_id);

        if !sink.has_script(SCRIPT) {
            sink.add_script(SCRIPT);
        }
        sink.push(TrackerCall::new(TRACKER, "addPixelId", vec![json!(config.pixel_id)]));

        let plugin = Self { sink };
        plugin.track("PixelInitialized", json!({}));

        let data = ctx.data().snapshot();
        match data["page"]["type"].as_str().unwrap_or_default() {
            "productdetail" => {
                if !data["product"].is_null() {
                    plugin.track_product("ViewContent", &data["product"]["ean"]);
                }
            }
            "checkout-confirmation" => {
                let order = &data["order"];
                let ids: Vec<Value> = order["products"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|product| product["ean"].clone())
                    .collect();
                plugin.track(
                    "Purchase",
                    json!({
                        "value": order["priceData"]["total"],
                        "currency": config.currency,
                        "content_ids": ids,
                        "content_type": "product",
                    }),
                );
            }
            other => debug!("Facebook WCA: no product data for page type '{}'", other),
        }
        Ok(plugin)
    }

    fn track(&self, kind: &str, data: Value) {
        self.sink
            .push(TrackerCall::new(TRACKER, "track", vec![json!(kind), data]));
    }

    fn track_product(&self, kind: &str, ean: &Value) {
        self.track(kind, json!({"content_ids": [ean], "content_type": "product"}));
    }
}

impl Plugin for FacebookWca {
    fn handle_event(&self, event: &Event) -> odl_core::Result<()> {
        let product = &event.data["product"];
        if product.is_null() {
            return Ok(());
        }
        match event.name() {
            "addtocart" => self.track_product("AddToCart", &product["ean"]),
            "product-changevariant" => self.track_product("ViewContent", &product["ean"]),
            _ => {}
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::layer_with;
    use crate::FACEBOOK_WCA_ID;

    fn page(kind: &str) -> Value {
        json!({"page": {"type": kind, "name": "x"}, "site": {"id": "s"}, "user": {}})
    }

    #[test_log::test]
    fn test_pixel_initialization() {
        let (_layer, sink) = layer_with(FACEBOOK_WCA_ID, page("homepage"), json!({"pixelId": "px-1"}), "");
        let calls = sink.calls_for(TRACKER);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command, "addPixelId");
        assert_eq!(calls[0].args, vec![json!("px-1")]);
        assert_eq!(calls[1].args, vec![json!("PixelInitialized"), json!({})]);
        assert_eq!(sink.scripts(), [SCRIPT]);
    }

    #[test_log::test]
    fn test_product_detail_view() {
        let mut data = page("productdetail");
        data["product"] = json!({"ean": "4001"});
        let (_layer, sink) = layer_with(FACEBOOK_WCA_ID, data, json!({"pixelId": "px"}), "");
        let last = sink.calls_for(TRACKER).pop().unwrap();
        assert_eq!(
            last.args,
            vec![json!("ViewContent"), json!({"content_ids": ["4001"], "content_type": "product"})]
        );
    }

    #[test_log::test]
    fn test_purchase_uses_configured_currency() {
        let mut data = page("checkout-confirmation");
        data["order"] = json!({"priceData": {"total": 99.5}, "products": [{"ean": "1"}, {"ean": "2"}]});
        let (_layer, sink) = layer_with(
            FACEBOOK_WCA_ID,
            data,
            json!({"pixelId": "px", "currency": "CHF"}),
            "",
        );
        let last = sink.calls_for(TRACKER).pop().unwrap();
        assert_eq!(last.args[0], json!("Purchase"));
        assert_eq!(
            last.args[1],
            json!({"value": 99.5, "currency": "CHF", "content_ids": ["1", "2"], "content_type": "product"})
        );
    }

    #[test_log::test]
    fn test_events_need_product() {
        let (layer, sink) = layer_with(FACEBOOK_WCA_ID, page("homepage"), json!({"pixelId": "px"}), "");
        layer.broadcast(Event::new("addtocart", json!({})));
        assert_eq!(sink.calls_for(TRACKER).len(), 2);

        layer.broadcast(Event::new("addtocart", json!({"product": {"ean": "7"}})));
        layer.broadcast(Event::new("product-changevariant", json!({"product": {"ean": "8"}})));
        let calls = sink.calls_for(TRACKER);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2].args[0], json!("AddToCart"));
        assert_eq!(calls[3].args[0], json!("ViewContent"));
    }

    #[test_log::test]
    fn test_missing_pixel_id_fails() {
        let (layer, sink) = layer_with(FACEBOOK_WCA_ID, page("homepage"), json!({}), "");
        assert!(sink.calls().is_empty());
        assert!(layer.get_plugin(FACEBOOK_WCA_ID).is_none());
    }
}
