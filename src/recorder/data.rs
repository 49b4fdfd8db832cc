use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ReadingRecord {
    pub timestamp: String, // UTC ISO timestamp
    pub channel: u8,
    pub sensor_type: String, // "NONE" without a sensor
    #[serde(rename = "voltage_V")]
    pub voltage: f32,
    #[serde(rename = "power_dBm")]
    pub power_dbm: Option<f32>, // empty cell without a reading
    #[serde(rename = "frequency_MHz")]
    pub frequency_mhz: u16,
}
