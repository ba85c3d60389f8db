//! Google Analytics (analytics.js) integration

use crate::plugin_config;
use crate::sink::{TrackerCall, TrackerSink};
use odl_core::{Event, Plugin, PluginContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use tracing::{debug, info};

const TRACKER: &str = "ga";
const SCRIPT: &str = "//www.google-analytics.com/analytics.js";

/// Cookie lifetime handed to `create`, two years in seconds
const COOKIE_EXPIRES: u64 = 6_307_200;

/// Page types that need the enhanced ecommerce plugin
const EC_PAGE_TYPES: [&str; 5] = [
    "productdetail",
    "checkout-cart",
    "checkout-login",
    "checkout-lastCheck",
    "checkout-confirmation",
];

const PAGE_NAME_PREFIXES: [(&str, &str); 2] = [("ZumWarenkorb/", "AddToCart/"), ("Produkt/", "Product/")];

const PAGE_NAMES: [(&str, &str); 11] = [
    ("Startseite", "Homepage"),
    ("Fehlerseite", "Error"),
    ("Suchergebnis", "SearchResult"),
    ("Bestellprozess/Warenkorb", "Checkout/Basket"),
    ("Bestellprozess/Login", "Checkout/Login"),
    ("Bestellprozess/Gastbestellung", "Checkout/CustomerDataGuest"),
    ("Bestellprozess/Registrierung", "Checkout/CustomerDataNewCustomer"),
    ("Bestellprozess/Lieferung", "Checkout/DeliveryData"),
    ("Bestellprozess/Zahlungsart", "Checkout/PaymentData"),
    ("Bestellprozess/Pruefen", "Checkout/LastCheck"),
    ("Bestellprozess/Bestaetigung", "Checkout/OrderConfirmation"),
];

fn default_live_site_id() -> String {
    "jump_live".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaConfig {
    /// Property id used on the live site
    #[serde(default)]
    pub ga_prod_id: String,
    /// Property id used everywhere else
    #[serde(default)]
    pub ga_dev_id: String,
    /// Named tracker, avoids clashing with an existing implementation
    #[serde(default)]
    pub tracker_name: Option<String>,
    /// Translate German page names to English
    #[serde(default)]
    pub map_pagenames_to_english: bool,
    #[serde(default = "default_live_site_id")]
    pub live_site_id: String,
}

pub struct GoogleAnalytics {
    config: GaConfig,
    prefix: String,
    sink: Arc<dyn TrackerSink>,
}

impl GoogleAnalytics {
    pub fn new(ctx: &PluginContext, sink: Arc<dyn TrackerSink>) -> odl_core::Result<Self> {
        let config: GaConfig = plugin_config(ctx)?;
        info!("📊 Google Analytics: initializing");

        let prefix = config
            .tracker_name
            .as_ref()
            .map(|name| format!("{}.", name))
            .unwrap_or_default();

        if !sink.has_script(SCRIPT) {
            sink.add_script(SCRIPT);
        }

        let plugin = Self { config, prefix, sink };
        let data = ctx.data().snapshot();
        plugin.track_page(&data, &ctx.environment().query_pairs(), &ctx.environment().user_agent);
        Ok(plugin)
    }

    fn ga(&self, command: &str, args: Vec<Value>) {
        self.sink
            .push(TrackerCall::new(TRACKER, format!("{}{}", self.prefix, command), args));
    }

    fn track_page(&self, data: &Value, query: &[(String, String)], user_agent: &str) {
        let site_id = data["site"]["id"].as_str().unwrap_or_default();
        let ua_id = if site_id == self.config.live_site_id {
            &self.config.ga_prod_id
        } else {
            &self.config.ga_dev_id
        };

        self.sink.push(TrackerCall::new(
            TRACKER,
            "create",
            vec![
                json!(ua_id),
                json!({
                    "name": self.config.tracker_name,
                    "cookieDomain": "auto",
                    "cookieExpires": COOKIE_EXPIRES,
                    "allowLinker": true,
                }),
            ],
        ));
        self.ga("set", vec![json!("anonymizeIp"), json!(true)]);
        self.ga("require", vec![json!("displayfeatures")]);

        let page_type = data["page"]["type"].as_str().unwrap_or_default();
        let raw_name = data["page"]["name"].as_str().unwrap_or_default();
        if EC_PAGE_TYPES.contains(&page_type) {
            self.ga("require", vec![json!("ec")]);
        }

        let mut page_name = json!(self.map_page_name(raw_name));
        match page_type {
            "category" => {
                page_name = data["category"]["id"].clone();
            }
            "productdetail" => {
                page_name = json!(strip_product_number(raw_name));
                self.add_product(&data["product"], 1, "");
                self.ga("ec:setAction", vec![json!("detail")]);
            }
            "checkout-cart" => {
                for product in items(&data["cart"]["products"]) {
                    self.add_product(product, 1, "");
                }
                self.ga("ec:setAction", vec![json!("checkout"), json!({"step": 1})]);
            }
            "checkout-login" => {
                self.ga("ec:setAction", vec![json!("checkout"), json!({"step": 2})]);
            }
            "checkout-lastCheck" => {
                self.ga("ec:setAction", vec![json!("checkout"), json!({"step": 3})]);
            }
            "checkout-confirmation" => {
                let order = &data["order"];
                for product in items(&order["products"]) {
                    let quantity = product["quantity"].as_u64().unwrap_or(1);
                    self.add_product(product, quantity, "");
                }
                self.ga(
                    "ec:setAction",
                    vec![
                        json!("purchase"),
                        json!({
                            "id": order["id"],
                            "affiliation": "",
                            "revenue": order["priceData"]["total"],
                            "tax": order["priceData"]["VAT"],
                            "shipping": order["shipping"],
                            "coupon": order["couponCode"],
                        }),
                    ],
                );
            }
            _ => {}
        }

        self.track_dimension("dimension1", page_name, false);
        self.track_dimension("dimension2", json!(escape(user_agent)), true);
        self.track_campaign(query);
        self.ga("send", vec![json!("pageview")]);
    }

    fn track_dimension(&self, name: &str, value: Value, keep_case: bool) {
        let value = match value {
            Value::String(s) if !keep_case => Value::String(s.to_lowercase()),
            other => other,
        };
        self.ga("set", vec![json!({ name: value })]);
    }

    /// Campaign attribution from `emsrc`, `refId` and `newsletter` query parameters
    fn track_campaign(&self, query: &[(String, String)]) {
        let param = |name: &str| {
            query
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        let medium = param("emsrc").filter(|m| !m.is_empty());
        let campaign: Option<Vec<&str>> = param("refId").map(|r| r.split('/').collect());
        let newsletter = param("newsletter").filter(|n| !n.is_empty());

        let has_campaign = medium.is_some() && campaign.as_ref().map(|c| !c.is_empty()).unwrap_or(false);
        let has_newsletter = newsletter.map(|n| n.len() > 1).unwrap_or(false);
        if !has_campaign && !has_newsletter {
            return;
        }

        let lower = |s: Option<&str>| s.map(|s| json!(s.to_lowercase())).unwrap_or(Value::Null);
        let (name, source, medium) = match newsletter {
            Some(newsletter) => {
                let mut parts = newsletter.split('/');
                let source = parts.next();
                let name = parts.next();
                (name, source, Some("newsletter"))
            }
            None => {
                let parts = campaign.unwrap_or_default();
                let first = parts.first().copied();
                let name = parts.get(1).copied().filter(|s| !s.is_empty()).or(first);
                (name, first, medium)
            }
        };

        debug!("Google Analytics: campaign source {:?}", source);
        self.ga(
            "set",
            vec![json!({
                "campaignName": lower(name),
                "campaignSource": lower(source),
                "campaignMedium": lower(medium),
            })],
        );
    }

    fn add_product(&self, product: &Value, quantity: u64, coupon: &str) {
        self.ga(
            "ec:addProduct",
            vec![json!({
                "id": product["ean"],
                "name": product["name"],
                "category": product["abteilungNummer"],
                "brand": product["brand"],
                "variant": product["aonr"],
                "price": product["priceData"]["total"],
                "coupon": coupon,
                "quantity": quantity,
            })],
        );
    }

    fn map_page_name(&self, name: &str) -> String {
        if !self.config.map_pagenames_to_english {
            return name.to_string();
        }
        let mut name = name.to_string();
        for (from, to) in PAGE_NAME_PREFIXES {
            if let Some(rest) = name.strip_prefix(from) {
                name = format!("{}{}", to, rest);
            }
        }
        PAGE_NAMES
            .iter()
            .find(|(from, _)| *from == name)
            .map(|(_, to)| to.to_string())
            .unwrap_or(name)
    }
}

impl Plugin for GoogleAnalytics {
    fn handle_event(&self, event: &Event) -> odl_core::Result<()> {
        if event.name() == "addtocart" {
            self.add_product(&event.data["product"], 1, "");
            self.ga("ec:setAction", vec![json!("add")]);
            self.ga(
                "send",
                vec![json!("event"), json!("UX"), json!("click"), json!("add to cart")],
            );
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn items(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

/// Drop a trailing `/<8 or more digits>` article number
fn strip_product_number(name: &str) -> &str {
    match name.rsplit_once('/') {
        Some((head, tail)) if tail.len() >= 8 && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => name,
    }
}

/// Percent-encode like the legacy `escape()` page helper
fn escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::layer_with;
    use crate::GA_ID;

    fn config() -> Value {
        json!({"gaProdId": "UA-PROD", "gaDevId": "UA-DEV", "trackerName": "odl", "mapPagenamesToEnglish": true})
    }

    fn commands(sink: &crate::RecordingSink) -> Vec<String> {
        sink.calls_for(TRACKER).into_iter().map(|c| c.command).collect()
    }

    #[test_log::test]
    fn test_homepage_tracking() {
        let data = json!({"page": {"type": "homepage", "name": "Startseite"}, "site": {"id": "jump_live"}, "user": {}});
        let (_layer, sink) = layer_with(GA_ID, data, config(), "");

        let calls = sink.calls_for(TRACKER);
        assert_eq!(calls[0].command, "create");
        assert_eq!(calls[0].args[0], json!("UA-PROD"));
        assert_eq!(calls[0].args[1]["name"], json!("odl"));
        assert_eq!(
            commands(&sink),
            ["create", "odl.set", "odl.require", "odl.set", "odl.set", "odl.send"]
        );
        assert_eq!(calls[3].args[0], json!({"dimension1": "homepage"}));
        assert_eq!(
            calls[4].args[0],
            json!({"dimension2": "Mozilla%2F5.0%20%28X11%3B%20Linux%20x86_64%29"})
        );
        assert_eq!(sink.scripts(), [SCRIPT]);
    }

    #[test_log::test]
    fn test_product_detail_uses_ecommerce() {
        let data = json!({
            "page": {"type": "productdetail", "name": "Produkt/Schuh/12345678"},
            "site": {"id": "staging"},
            "user": {},
            "product": {"ean": "4001", "name": "Shoe", "priceData": {"total": 59.9}},
        });
        let (layer, sink) = layer_with(GA_ID, data, config(), "");

        let calls = sink.calls_for(TRACKER);
        assert_eq!(calls[0].args[0], json!("UA-DEV"));
        assert!(commands(&sink).contains(&"odl.ec:addProduct".to_string()));
        let dimension = calls.iter().find(|c| c.args[0].get("dimension1").is_some()).unwrap();
        assert_eq!(dimension.args[0], json!({"dimension1": "produkt/schuh"}));

        layer.broadcast(Event::new("addtocart", json!({"product": {"ean": "4002"}})));
        let tail: Vec<_> = commands(&sink).into_iter().rev().take(3).collect();
        assert_eq!(tail, ["odl.send", "odl.ec:setAction", "odl.ec:addProduct"]);
    }

    #[test_log::test]
    fn test_confirmation_purchase() {
        let data = json!({
            "page": {"type": "checkout-confirmation", "name": "Bestellprozess/Bestaetigung"},
            "site": {"id": "jump_live"},
            "user": {},
            "order": {
                "id": "o-1", "shipping": 4.95, "couponCode": "SPRING",
                "priceData": {"total": 120.0, "VAT": 19.16},
                "products": [{"ean": "1", "quantity": 2}, {"ean": "2"}],
            },
        });
        let (_layer, sink) = layer_with(GA_ID, data, config(), "");
        let calls = sink.calls_for(TRACKER);

        let added: Vec<_> = calls.iter().filter(|c| c.command == "odl.ec:addProduct").collect();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].args[0]["quantity"], json!(2));
        assert_eq!(added[1].args[0]["quantity"], json!(1));

        let purchase = calls.iter().find(|c| c.args.first() == Some(&json!("purchase"))).unwrap();
        assert_eq!(purchase.args[1]["revenue"], json!(120.0));
        assert_eq!(purchase.args[1]["coupon"], json!("SPRING"));

        let dimension = calls.iter().find(|c| c.args[0].get("dimension1").is_some()).unwrap();
        assert_eq!(dimension.args[0], json!({"dimension1": "checkout/orderconfirmation"}));
    }

    #[test_log::test]
    fn test_campaign_from_query() {
        let data = json!({"page": {"type": "home", "name": "Home"}, "site": {"id": "s1"}, "user": {}});
        let (_layer, sink) = layer_with(GA_ID, data.clone(), config(), "?emsrc=Email&refId=Partner/Spring");
        let campaign = sink
            .calls_for(TRACKER)
            .into_iter()
            .find(|c| c.args[0].get("campaignName").is_some())
            .unwrap();
        assert_eq!(
            campaign.args[0],
            json!({"campaignName": "spring", "campaignSource": "partner", "campaignMedium": "email"})
        );

        let (_layer, sink) = layer_with(GA_ID, data, config(), "newsletter=NL/Weekly");
        let campaign = sink
            .calls_for(TRACKER)
            .into_iter()
            .find(|c| c.args[0].get("campaignName").is_some())
            .unwrap();
        assert_eq!(
            campaign.args[0],
            json!({"campaignName": "weekly", "campaignSource": "nl", "campaignMedium": "newsletter"})
        );
    }

    #[test_log::test]
    fn test_empty_newsletter_falls_back_to_campaign() {
        let data = json!({"page": {"type": "home", "name": "Home"}, "site": {"id": "s1"}, "user": {}});
        let (_layer, sink) = layer_with(GA_ID, data, config(), "?newsletter=&emsrc=x&refId=a/b");
        let campaign = sink
            .calls_for(TRACKER)
            .into_iter()
            .find(|c| c.args[0].get("campaignName").is_some())
            .unwrap();
        assert_eq!(
            campaign.args[0],
            json!({"campaignName": "b", "campaignSource": "a", "campaignMedium": "x"})
        );
    }

    #[test_log::test]
    fn test_invalid_config_fails_construction() {
        let data = json!({"page": {"type": "home", "name": "Home"}, "site": {"id": "s1"}, "user": {}});
        let (layer, sink) = layer_with(GA_ID, data, json!({"gaProdId": 42}), "");
        assert!(sink.calls().is_empty());
        assert!(!layer.has_plugin(GA_ID));
        assert!(layer.is_ready());
    }

    #[test_log::test]
    fn test_helpers() {
        assert_eq!(strip_product_number("Produkt/Schuh/123456789"), "Produkt/Schuh");
        assert_eq!(strip_product_number("Produkt/Schuh/1234"), "Produkt/Schuh/1234");
        assert_eq!(escape("a b/c"), "a%20b%2Fc");
    }
}
