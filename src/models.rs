//! Field-service data models (shared between the local store, the API and the backend)
//!
//! Local JSON uses camelCase keys. IDs are strings and audit timestamps are
//! RFC 3339 strings, like the rows the hosted backend returns.

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Status label used for devices with no recorded status
pub const UNDEFINED_STATUS: &str = "Não definido";

/// Anything stored in a list collection and addressable by id
pub trait Record {
    fn record_id(&self) -> String;
}

/// Wall-clock time of day, always rendered as zero-padded `HH:mm`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockTime(NaiveTime);

impl ClockTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(Self)
    }

    pub fn as_time(self) -> NaiveTime {
        self.0
    }

    /// Drops seconds so the value round-trips through `HH:mm`
    pub fn from_time(time: NaiveTime) -> Self {
        Self(NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time '{0}', expected HH:mm")]
pub struct ClockTimeError(String);

impl FromStr for ClockTime {
    type Err = ClockTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Fixed width keeps string order and time order identical
        if s.len() != 5 || s.as_bytes().get(2) != Some(&b':') {
            return Err(ClockTimeError(s.to_string()));
        }
        NaiveTime::parse_from_str(s, "%H:%M")
            .map(Self)
            .map_err(|_| ClockTimeError(s.to_string()))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    Contrato,
    Emergencial,
    Avulso,
}

/// Lifecycle of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    #[default]
    #[serde(alias = "scheduled")]
    Pending,
    #[serde(alias = "inProgress")]
    InProgress,
    Completed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The only edges of the lifecycle graph.
    ///
    /// `in_progress -> cancelled` and every backwards edge are rejected.
    pub fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal()
            && matches!(
                (self, next),
                (Self::Pending, Self::InProgress)
                    | (Self::InProgress, Self::Completed)
                    | (Self::Pending, Self::Cancelled)
            )
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned or in-progress service visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_address: String,
    pub date: NaiveDate,
    pub start_time: ClockTime,
    pub end_time: ClockTime,
    pub service_type: ServiceType,
    #[serde(default)]
    pub status: ScheduleStatus,
    #[serde(default)]
    pub technician: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub started_at: Option<ClockTime>,
    #[serde(default)]
    pub completed_at: Option<ClockTime>,
    #[serde(default)]
    pub cancel_reason: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for Schedule {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Raw schedule form, validated by the scheduling service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub service_type: Option<ServiceType>,
    #[serde(default)]
    pub technician: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Customer record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Client {
    pub id: String,
    pub code: String,
    pub name: String,
    pub document: String,
    pub address: String,
    pub neighborhood: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub branch: String,
    pub contact: String,
    pub phone: String,
    pub email: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Client {
    /// `address, city - state`, the form denormalised into schedules
    pub fn full_address(&self) -> String {
        let mut out = self.address.clone();
        if !self.city.is_empty() {
            if !out.is_empty() {
                out.push_str(", ");
            }
            out.push_str(&self.city);
        }
        if !self.state.is_empty() {
            if !out.is_empty() {
                out.push_str(" - ");
            }
            out.push_str(&self.state);
        }
        out
    }
}

impl Record for Client {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Pest-monitoring unit inspected during a visit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    #[serde(rename = "type")]
    pub device_type: String,
    pub number: u32,
    #[serde(default)]
    pub status: String,
}

impl Device {
    /// Blank (empty or whitespace-only) status reads as the undefined sentinel;
    /// other labels are trimmed so "Conforme " groups with "Conforme"
    pub fn status_label(&self) -> &str {
        let trimmed = self.status.trim();
        if trimmed.is_empty() {
            UNDEFINED_STATUS
        } else {
            trimmed
        }
    }
}

impl Record for Device {
    fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// Product applied during a service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub active_ingredient: String,
    pub chemical_group: String,
    pub registration: String,
    pub batch: String,
    pub validity: String,
    pub quantity: String,
    pub measure: String,
    pub dilution: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Record for Product {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOrderStatus {
    InProgress,
    Completed,
    Cancelled,
}

/// Signatures captured on site
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderSignatures {
    pub service_responsible: String,
    pub technical_responsible: String,
    pub client_representative: String,
}

/// Pests of one kind found at a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PestCount {
    pub name: String,
    pub count: u32,
}

/// Pest tally for one inspected device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePestCount {
    pub device_type: String,
    pub device_number: u32,
    #[serde(default)]
    pub pests: Vec<PestCount>,
}

/// Record produced when a visit is started, finished or registered as not served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOrder {
    pub id: String,
    pub order_number: u64,
    pub schedule_id: String,
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub client_address: String,
    pub service_type: ServiceType,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<ClockTime>,
    #[serde(default)]
    pub end_time: Option<ClockTime>,
    pub status: ServiceOrderStatus,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub product: Option<Product>,
    #[serde(default)]
    pub product_amount: String,
    #[serde(default)]
    pub target_pest: String,
    #[serde(default)]
    pub pest_counts: Vec<DevicePestCount>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub application_method: String,
    #[serde(default)]
    pub observations: String,
    #[serde(default)]
    pub no_service_reason: Option<String>,
    #[serde(default)]
    pub signatures: OrderSignatures,
    /// Registered after the fact with an explicit date and window
    #[serde(default)]
    pub retroactive: bool,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl Record for ServiceOrder {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

/// Partial update of the on-site capture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceOrderUpdate {
    pub devices: Option<Vec<Device>>,
    pub product: Option<Product>,
    pub product_amount: Option<String>,
    pub target_pest: Option<String>,
    pub pest_counts: Option<Vec<DevicePestCount>>,
    pub location: Option<String>,
    pub application_method: Option<String>,
    pub observations: Option<String>,
    pub signatures: Option<OrderSignatures>,
}

/// Company profile printed on reports
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub document: String,
    pub address: String,
    pub phone: String,
    pub email: String,
    pub environmental_license: String,
    pub sanitary_permit: String,
    pub updated_at: String,
}

/// Profile of the technician using the device
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserData {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: String,
    pub role: String,
    pub updated_at: String,
}

/// Stored signature image, one per signature type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Signature {
    pub id: String,
    pub signature_type: String,
    pub name: String,
    pub image: String,
    pub updated_at: String,
}

impl Record for Signature {
    fn record_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_requires_zero_padded_format() {
        assert_eq!("09:30".parse::<ClockTime>().unwrap(), ClockTime::new(9, 30).unwrap());
        assert!("9:30".parse::<ClockTime>().is_err());
        assert!("24:00".parse::<ClockTime>().is_err());
        assert!("09:30:00".parse::<ClockTime>().is_err());
        assert_eq!(ClockTime::new(7, 5).unwrap().to_string(), "07:05");
    }

    #[test]
    fn clock_time_order_matches_string_order() {
        let a: ClockTime = "09:59".parse().unwrap();
        let b: ClockTime = "10:00".parse().unwrap();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn status_accepts_legacy_spellings() {
        let s: ScheduleStatus = serde_json::from_str("\"scheduled\"").unwrap();
        assert_eq!(s, ScheduleStatus::Pending);
        let s: ScheduleStatus = serde_json::from_str("\"inProgress\"").unwrap();
        assert_eq!(s, ScheduleStatus::InProgress);
        assert_eq!(
            serde_json::to_string(&ScheduleStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }

    #[test]
    fn transition_graph() {
        use ScheduleStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));

        assert!(!InProgress.can_transition_to(Pending));
        assert!(!InProgress.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, InProgress, Completed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn blank_device_status_is_undefined() {
        let device = |status: &str| Device {
            id: 1,
            device_type: "PPI".into(),
            number: 3,
            status: status.into(),
        };
        assert_eq!(device("").status_label(), UNDEFINED_STATUS);
        assert_eq!(device("  ").status_label(), UNDEFINED_STATUS);
        assert_eq!(device(" Conforme ").status_label(), "Conforme");
    }

    #[test]
    fn client_full_address() {
        let client = Client {
            address: "Rua A, 10".into(),
            city: "Santos".into(),
            state: "SP".into(),
            ..Default::default()
        };
        assert_eq!(client.full_address(), "Rua A, 10, Santos - SP");
        assert_eq!(Client::default().full_address(), "");
    }
}
