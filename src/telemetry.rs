use serde::Serialize;

use crate::airvisual::NearestCityResponse;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub city: String,
    pub state: String,
    pub country: String,
    pub coordinates: [f64; 2],
    pub timestamp: String,
    pub aqi_us: u32,
    pub main_pollutant: String,
    pub temperature: i32,
    pub humidity: u32,
}

impl From<&NearestCityResponse> for TelemetryRecord {
    fn from(response: &NearestCityResponse) -> Self {
        let data = &response.data;
        let weather = &data.current.weather;
        let pollution = &data.current.pollution;

        TelemetryRecord {
            city: data.city.clone(),
            state: data.state.clone(),
            country: data.country.clone(),
            coordinates: data.location.coordinates,
            timestamp: weather.ts.clone(),
            aqi_us: pollution.aqius,
            main_pollutant: pollution.mainus.clone(),
            temperature: weather.tp,
            humidity: weather.hu,
        }
    }
}
