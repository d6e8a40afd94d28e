use crate::models::DeviceId;

/// Erreurs d'échange avec le backing store (lecture, insert, abonnement).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
    #[error("Subscription closed")]
    Closed,
}

/// Enregistrement impossible à réconcilier.
#[derive(Debug, thiserror::Error)]
pub enum RowError {
    #[error("missing device id")]
    MissingDeviceId,
    #[error("device id out of range: {0}")]
    InvalidDeviceId(i64),
    #[error("missing fill level for device {0}")]
    MissingFillLevel(DeviceId),
    #[error("fill level is not a number for device {0}")]
    InvalidFillLevel(DeviceId),
    #[error("unparseable timestamp: {0}")]
    BadTimestamp(String),
    #[error("stored row for device {0} has no timestamp")]
    MissingTimestamp(DeviceId),
}

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("{name} must be within [0, 1], got {value}")]
    Probability { name: &'static str, value: f64 },
    #[error("synthetic delta range is inverted: {min} > {max}")]
    InvertedDelta { min: i32, max: i32 },
    #[error("backing mode `rest` requires a `rest.url`")]
    MissingRestUrl,
}
