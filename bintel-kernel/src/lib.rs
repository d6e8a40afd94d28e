//! Kernel de réconciliation de la télémétrie d'une flotte de bacs.
//!
//! Fusionne un flux push et une lecture périodique de la table en un seul
//! état de flotte, avec dédup par appareil. Le bac instrumenté est forcé au
//! repos quand il se tait ; les autres suivent une marche aléatoire.

pub mod backing;
pub mod clock;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod http;
pub mod liveness;
pub mod models;
pub mod poll;
pub mod push;
pub mod reconcile;
pub mod subscribers;
pub mod synthetic;

pub use engine::{EngineStatus, TelemetryEngine};
pub use fleet::{FleetSnapshot, FleetStateStore};
pub use models::{Device, DeviceId, DeviceStatus, FleetStats, NormalizedUpdate, UpdateSource};
