//! Typed schemas for the pull endpoints.
//!
//! Used to validate response bodies; the poller stores the raw JSON.

use serde::{Deserialize, Serialize};

/// One row of `GET /api/regions/summary`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSummary {
    pub region_id: String,
    pub region_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub carbon_gco2_kwh: f64,
    #[serde(default)]
    pub carbon_index: String,
    #[serde(default)]
    pub carbon_source: String,
    #[serde(default)]
    pub temperature_c: f64,
    #[serde(default)]
    pub wind_kmh: f64,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub cheapest_gpu_name: String,
    #[serde(default)]
    pub cheapest_spot_price: f64,
    #[serde(default)]
    pub cheapest_ondemand_price: f64,
    #[serde(default)]
    pub cheapest_savings_pct: f64,
    #[serde(default)]
    pub cheapest_sku: String,
}

/// Body of `GET /api/prices/curve`: a 24-hour spot price curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCurve {
    pub region_id: String,
    #[serde(default)]
    pub gpu_name: String,
    #[serde(default)]
    pub sku: String,
    /// Either real history or a model fallback, as reported by the backend.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub history_points: u32,
    pub data: Vec<PricePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Hour label such as `"03h"`.
    pub hour: String,
    pub spot: f64,
    pub ondemand: f64,
    /// `"scraped"` or `"model"`.
    #[serde(default)]
    pub source: String,
}
