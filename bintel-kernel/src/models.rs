/**
 * MODELS - Entités de la flotte et enregistrements indépendants du canal
 *
 * RÔLE :
 * - Device           = un bac
 * - NormalizedUpdate = forme commune de tout producteur avant réconciliation
 * - TelemetryRow     = ligne `bin_updates` telle que le store la renvoie
 * - FleetStats       = dérivé, jamais stocké
 */

use crate::error::RowError;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub type DeviceId = u32;

/// Seuils de remplissage partagés par le store et le simulateur.
pub const WARNING_THRESHOLD: f64 = 50.0;
pub const CRITICAL_THRESHOLD: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Normal,
    Warning,
    Critical,
    Servicing,
}

impl DeviceStatus {
    /// Statut déduit du seul remplissage.
    pub fn from_fill_level(fill_level: f64) -> Self {
        if fill_level >= CRITICAL_THRESHOLD {
            DeviceStatus::Critical
        } else if fill_level >= WARNING_THRESHOLD {
            DeviceStatus::Warning
        } else {
            DeviceStatus::Normal
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(DeviceStatus::Normal),
            "warning" => Some(DeviceStatus::Warning),
            "critical" => Some(DeviceStatus::Critical),
            "servicing" => Some(DeviceStatus::Servicing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    General,
    Recyclable,
    Organic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub location: Location,
    pub fill_level: f64,
    pub capacity: u32,
    pub battery_level: f64,
    pub status: DeviceStatus,
    pub category: Category,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

/// Qui a produit la mise à jour. Synthetic et Liveness contournent la dédup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Push,
    Poll,
    Liveness,
    Synthetic,
    Manual,
}

impl UpdateSource {
    /// Sources adossées à la table de télémétrie externe.
    pub fn is_channel(self) -> bool {
        matches!(self, UpdateSource::Push | UpdateSource::Poll | UpdateSource::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedUpdate {
    pub device_id: DeviceId,
    pub fill_level: f64,
    pub battery_level: Option<f64>,
    pub status: Option<DeviceStatus>,
    /// Horodatage source, millisecondes unix.
    pub timestamp: i64,
    pub source: UpdateSource,
}

/// Événement qui a livré la ligne ; choisit la colonne d'horodatage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Une ligne de la table, telle que le store la renvoie.
///
/// Tout est optionnel sur le fil ; `normalize` décide de ce qui est requis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub bin_id: Option<i64>,
    #[serde(default)]
    pub fill_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl TelemetryRow {
    pub fn reading(bin_id: DeviceId, fill_level: f64, battery_level: Option<f64>) -> Self {
        Self {
            bin_id: Some(i64::from(bin_id)),
            fill_level: Some(fill_level),
            battery_level,
            ..Default::default()
        }
    }

    pub fn with_created_at(mut self, at: OffsetDateTime) -> Self {
        self.created_at = at.format(&Rfc3339).ok();
        self
    }

    /// Colonne d'horodatage pour ce type de changement, en ms unix.
    pub fn source_timestamp(&self, kind: ChangeKind) -> Result<Option<i64>, RowError> {
        let raw = match kind {
            ChangeKind::Insert => self.created_at.as_deref(),
            ChangeKind::Update => self.updated_at.as_deref().or(self.created_at.as_deref()),
        };
        match raw {
            None => Ok(None),
            Some(s) => OffsetDateTime::parse(s, &Rfc3339)
                .map(|t| Some(unix_millis(t)))
                .map_err(|_| RowError::BadTimestamp(s.to_string())),
        }
    }

    /// Convertit une ligne vers la forme commune aux canaux.
    ///
    /// `received_at` (ms unix) remplace un horodatage source absent.
    pub fn normalize(
        &self,
        kind: ChangeKind,
        source: UpdateSource,
        received_at: i64,
    ) -> Result<NormalizedUpdate, RowError> {
        self.normalize_with(kind, source, Some(received_at))
    }

    /// Variante pour les lignes relues depuis la table : sans horodatage la
    /// ligne est rejetée, sinon elle serait réappliquée à chaque lecture.
    pub fn normalize_stored(&self, kind: ChangeKind, source: UpdateSource) -> Result<NormalizedUpdate, RowError> {
        self.normalize_with(kind, source, None)
    }

    fn normalize_with(
        &self,
        kind: ChangeKind,
        source: UpdateSource,
        received_at: Option<i64>,
    ) -> Result<NormalizedUpdate, RowError> {
        let raw_id = self.bin_id.ok_or(RowError::MissingDeviceId)?;
        let device_id = DeviceId::try_from(raw_id).map_err(|_| RowError::InvalidDeviceId(raw_id))?;
        let fill_level = self.fill_level.ok_or(RowError::MissingFillLevel(device_id))?;
        if !fill_level.is_finite() {
            return Err(RowError::InvalidFillLevel(device_id));
        }
        let battery_level = self.battery_level.filter(|b| b.is_finite());

        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => {
                let parsed = DeviceStatus::parse(raw);
                if parsed.is_none() {
                    tracing::warn!(device_id, status = raw, "unknown status in telemetry row, deriving from fill level");
                }
                parsed
            }
        };

        let timestamp = match (self.source_timestamp(kind)?, received_at) {
            (Some(ts), _) => ts,
            (None, Some(received_at)) => received_at,
            (None, None) => return Err(RowError::MissingTimestamp(device_id)),
        };

        Ok(NormalizedUpdate {
            device_id,
            fill_level,
            battery_level,
            status,
            timestamp,
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FleetStats {
    pub total_bins: usize,
    pub critical_bins: usize,
    pub avg_fill_level: f64,
    pub efficiency_score: u32,
    pub total_collections: u64,
}

impl FleetStats {
    /// Recompte tout depuis la table des appareils.
    pub fn compute<'a, I>(devices: I, total_collections: u64) -> Self
    where
        I: IntoIterator<Item = &'a Device>,
    {
        let mut total = 0usize;
        let mut critical = 0usize;
        let mut fill_sum = 0.0;
        for d in devices {
            total += 1;
            fill_sum += d.fill_level;
            if d.status == DeviceStatus::Critical {
                critical += 1;
            }
        }

        let avg_fill_level = if total == 0 { 0.0 } else { fill_sum / total as f64 };
        let critical_ratio = if total == 0 { 0.0 } else { critical as f64 / total as f64 };

        let mut score = 100.0 - critical_ratio * 50.0;
        if avg_fill_level > 70.0 {
            score -= 20.0;
        }
        if total_collections > 15 {
            score += 10.0;
        }
        let efficiency_score = score.floor().clamp(0.0, 100.0) as u32;

        Self {
            total_bins: total,
            critical_bins: critical,
            avg_fill_level,
            efficiency_score,
            total_collections,
        }
    }
}

pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn clamp_percent(value: f64) -> f64 {
    value.clamp(0.0, 100.0)
}
