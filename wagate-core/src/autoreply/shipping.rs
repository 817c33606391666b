//! Shipping-cost command: `cek ongkir [dari] <origin> ke <destination>
//! [<weight>kg] [<courier>]`. The lookup collaborator is behind a trait;
//! the production impl talks to the RajaOngkir starter API.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use wagate_common::Error;

const KNOWN_COURIERS: &str = "jne|pos|tiki|jnt|sicepat|anteraja|wahana|ninja";
const DEFAULT_COURIER: &str = "jne";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShippingQuery {
    pub origin: String,
    pub destination: String,
    pub weight_grams: u32,
    pub courier: String,
}

#[derive(Debug, Clone)]
pub struct ShippingService {
    pub service: String,
    pub description: String,
    pub cost: i64,
    pub etd: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ShippingClient: Send + Sync {
    async fn cost(&self, query: &ShippingQuery) -> Result<Vec<ShippingService>, Error>;
}

fn command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)^\s*cek\s+ongkir\s+(?:dari\s+)?(?P<origin>.+?)\s+ke\s+(?P<dest>.+?)(?:\s+(?P<weight>\d+(?:[.,]\d+)?)\s*kg)?(?:\s+(?P<courier>{}))?\s*$",
            KNOWN_COURIERS
        ))
        .expect("shipping command regex is valid")
    })
}

/// Parse the command, normalizing weight to grams and defaulting the
/// courier to `jne`.
pub fn parse_command(text: &str) -> Option<ShippingQuery> {
    let caps = command_regex().captures(text)?;
    let weight_kg: f64 = caps
        .name("weight")
        .map(|m| m.as_str().replace(',', "."))
        .and_then(|w| w.parse().ok())
        .unwrap_or(1.0);
    Some(ShippingQuery {
        origin: caps["origin"].trim().to_string(),
        destination: caps["dest"].trim().to_string(),
        weight_grams: (weight_kg * 1000.0).round().max(1.0) as u32,
        courier: caps
            .name("courier")
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_else(|| DEFAULT_COURIER.to_string()),
    })
}

fn format_rupiah(amount: i64) -> String {
    let digits = amount.to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    format!("Rp{}", out)
}

/// Render the per-service cost/ETA blocks under an origin/destination
/// header.
pub fn format_reply(query: &ShippingQuery, services: &[ShippingService]) -> String {
    let mut out = format!(
        "*Cek Ongkir*\nDari: {}\nKe: {}\nBerat: {} kg\nKurir: {}\n",
        query.origin,
        query.destination,
        query.weight_grams as f64 / 1000.0,
        query.courier.to_uppercase()
    );
    for svc in services {
        out.push_str(&format!(
            "\n*{}* - {}\n  {} ({} hari)",
            svc.service,
            svc.description,
            format_rupiah(svc.cost),
            svc.etd
        ));
    }
    out
}

/// Canonical help reply used whenever parsing succeeds but the lookup
/// fails, or the courier returns nothing.
pub fn help_reply() -> String {
    concat!(
        "Maaf, ongkir tidak dapat dicek saat ini.\n\n",
        "Format: *cek ongkir dari <kota asal> ke <kota tujuan> [berat]kg [kurir]*\n",
        "Contoh: cek ongkir dari Jakarta ke Surabaya 2kg jne"
    )
    .to_string()
}

/// RajaOngkir starter-tier client: city name resolution then a cost query.
pub struct RajaOngkirClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RajaOngkirClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn city_id(&self, name: &str) -> Result<String, Error> {
        let body: Value = self
            .http
            .get(format!("{}/city", self.base_url))
            .header("key", &self.api_key)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Dependency(format!("rajaongkir city lookup: {}", e)))?
            .json()
            .await?;

        let needle = name.to_lowercase();
        body["rajaongkir"]["results"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|city| {
                city["city_name"]
                    .as_str()
                    .map(|n| n.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .and_then(|city| city["city_id"].as_str().map(str::to_string))
            .ok_or_else(|| Error::Dependency(format!("unknown city '{}'", name)))
    }
}

#[async_trait]
impl ShippingClient for RajaOngkirClient {
    async fn cost(&self, query: &ShippingQuery) -> Result<Vec<ShippingService>, Error> {
        let origin = self.city_id(&query.origin).await?;
        let destination = self.city_id(&query.destination).await?;

        let params = [
            ("origin", origin),
            ("destination", destination),
            ("weight", query.weight_grams.to_string()),
            ("courier", query.courier.clone()),
        ];
        let body: Value = self
            .http
            .post(format!("{}/cost", self.base_url))
            .header("key", &self.api_key)
            .form(&params)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Dependency(format!("rajaongkir cost lookup: {}", e)))?
            .json()
            .await?;

        let services = body["rajaongkir"]["results"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|result| result["costs"].as_array().into_iter().flatten())
            .filter_map(|cost| {
                let detail = cost["cost"].as_array()?.first()?;
                Some(ShippingService {
                    service: cost["service"].as_str()?.to_string(),
                    description: cost["description"].as_str().unwrap_or_default().to_string(),
                    cost: detail["value"].as_i64()?,
                    etd: detail["etd"].as_str().unwrap_or("-").to_string(),
                })
            })
            .collect();
        Ok(services)
    }
}
