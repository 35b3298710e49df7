use serde::{Deserialize, Serialize};

use crate::error::HubResult;

/// One telemetry sample as exchanged on the wire.
///
/// Values are carried as opaque strings; the hub never parses them as numbers.
/// Missing fields decode as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sample {
    /// Waveform identifier (raw IR reading)
    #[serde(rename = "ir")]
    pub waveform: String,
    /// Instantaneous rate
    #[serde(rename = "bpm")]
    pub rate: String,
    /// Running-average rate
    #[serde(rename = "average_bpm")]
    pub average_rate: String,
}

impl Sample {
    pub fn new(
        waveform: impl Into<String>,
        rate: impl Into<String>,
        average_rate: impl Into<String>,
    ) -> Self {
        Self {
            waveform: waveform.into(),
            rate: rate.into(),
            average_rate: average_rate.into(),
        }
    }

    /// Decode a sample from a JSON payload (text or binary frame body)
    pub fn decode(payload: &[u8]) -> HubResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode to the JSON text sent to every peer
    pub fn encode(&self) -> HubResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
