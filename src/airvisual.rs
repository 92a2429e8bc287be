use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;

pub const DEFAULT_BASE_URL: &str = "http://api.airvisual.com";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NearestCityResponse {
    pub data: CityData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CityData {
    pub city: String,
    pub state: String,
    pub country: String,
    pub location: Location,
    pub current: Current,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Location {
    /// `[longitude, latitude]`
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Current {
    pub weather: Weather,
    pub pollution: Pollution,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Weather {
    pub ts: String,
    pub tp: i32,
    pub hu: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Pollution {
    pub aqius: u32,
    pub mainus: String,
}

pub struct AirVisualClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AirVisualClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    /// Error responses are reported with their raw body, JSON or not.
    pub async fn nearest_city(&self) -> Result<NearestCityResponse, anyhow::Error> {
        let url = format!("{}/v2/nearest_city", self.base_url.trim_end_matches('/'));

        let response = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to send nearest_city request")?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<unreadable body: {}>", e.without_url()));
            return Err(anyhow::anyhow!(
                "AirVisual nearest_city request failed with status {}: {}",
                status.as_u16(),
                body
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(reqwest::Error::without_url)
            .context("Failed to read nearest_city response body")?;

        serde_json::from_slice(&body).context("Failed to parse nearest_city response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_ignores_unknown_fields() {
        let body = r#"{
            "status": "success",
            "data": {
                "city": "Tokyo",
                "state": "Tokyo",
                "country": "Japan",
                "location": {"type": "Point", "coordinates": [139.69, 35.69]},
                "current": {
                    "weather": {"ts": "2024-05-01T03:00:00.000Z", "tp": 21, "pr": 1012, "hu": 55, "ws": 3.1, "wd": 180, "ic": "01d"},
                    "pollution": {"ts": "2024-05-01T03:00:00.000Z", "aqius": 37, "mainus": "p2", "aqicn": 13, "maincn": "p2"}
                }
            }
        }"#;

        let response: NearestCityResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.data.city, "Tokyo");
        assert_eq!(response.data.location.coordinates, [139.69, 35.69]);
        assert_eq!(response.data.current.weather.tp, 21);
        assert_eq!(response.data.current.pollution.aqius, 37);
    }

    #[test]
    fn test_deserialize_negative_temperature() {
        let body = r#"{"data":{"city":"Oulu","state":"North Ostrobothnia","country":"Finland","location":{"coordinates":[25.47,65.01]},"current":{"weather":{"ts":"2024-01-15T06:00:00.000Z","tp":-21,"hu":88},"pollution":{"aqius":12,"mainus":"o3"}}}}"#;

        let response: NearestCityResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.data.current.weather.tp, -21);
    }

    #[test]
    fn test_deserialize_rejects_missing_field() {
        let body = r#"{"data":{"city":"Paris","state":"Ile-de-France","country":"France","location":{"coordinates":[2.35,48.85]},"current":{"weather":{"ts":"2024-01-01T00:00:00.000Z","tp":10,"hu":80},"pollution":{"mainus":"p2"}}}}"#;

        let err = serde_json::from_str::<NearestCityResponse>(body).unwrap_err();

        assert!(err.to_string().contains("aqius"));
    }

    #[test]
    fn test_deserialize_rejects_short_coordinates() {
        let body = r#"{"data":{"city":"Paris","state":"Ile-de-France","country":"France","location":{"coordinates":[2.35]},"current":{"weather":{"ts":"2024-01-01T00:00:00.000Z","tp":10,"hu":80},"pollution":{"aqius":42,"mainus":"p2"}}}}"#;

        assert!(serde_json::from_str::<NearestCityResponse>(body).is_err());
    }
}
