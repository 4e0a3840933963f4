//! Wire schemas for the ride-sharing API.
//!
//! Response types list the fields a screen relies on as required, so a
//! payload that lacks them fails to decode instead of rendering blanks.

use std::collections::BTreeMap;
use std::fmt;

use geojson::{Geometry, Value as GeoValue};
use serde::{Deserialize, Serialize};

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(RideId);
typed_id!(RequestId);
typed_id!(PaymentId);

/// Validated lat/lon
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Option<Self> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) {
            return None;
        }
        if !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        Some(Self { lat, lon })
    }

    /// The API's `[longitude, latitude]` pair.
    pub fn to_lng_lat(self) -> [f64; 2] {
        [self.lon, self.lat]
    }

    pub fn to_point(self) -> Geometry {
        Geometry::new(GeoValue::Point(vec![self.lon, self.lat]))
    }

    pub fn from_point(geometry: &Geometry) -> Option<Self> {
        match &geometry.value {
            GeoValue::Point(position) if position.len() >= 2 => Self::new(position[1], position[0]),
            _ => None,
        }
    }
}

/// A place as echoed back by the server: a GeoJSON point, a bare `[lng, lat]` pair, or free text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Place {
    Point(Geometry),
    LngLat([f64; 2]),
    Address(String),
}

impl Place {
    pub fn lat_lon(&self) -> Option<LatLon> {
        match self {
            Place::Point(geometry) => LatLon::from_point(geometry),
            Place::LngLat([lng, lat]) => LatLon::new(*lat, *lng),
            Place::Address(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Rider,
    Driver,
    Admin,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub user_type: UserType,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub vehicle_info: Option<serde_json::Value>,
}

impl UserProfile {
    pub fn is_driver(&self) -> bool {
        self.user_type == UserType::Driver
    }
}

/// Someone shown alongside a ride or request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PersonSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub vehicle_info: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Active,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl RideStatus {
    pub fn is_open(self) -> bool {
        matches!(self, RideStatus::Active)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Ride {
    #[serde(alias = "_id")]
    pub id: RideId,
    pub driver_id: UserId,
    pub start_location: Geometry,
    pub end_location: Geometry,
    pub departure_time: String,
    #[serde(default)]
    pub estimated_arrival_time: Option<String>,
    pub available_seats: u32,
    pub price_per_seat: f64,
    pub status: RideStatus,
    #[serde(default)]
    pub route_polyline: Option<String>,
    #[serde(default)]
    pub additional_info: Option<serde_json::Value>,
    #[serde(default)]
    pub riders: Vec<serde_json::Value>,
    #[serde(default)]
    pub driver: Option<PersonSummary>,
}

impl Ride {
    pub fn start(&self) -> Option<LatLon> {
        LatLon::from_point(&self.start_location)
    }

    pub fn end(&self) -> Option<LatLon> {
        LatLon::from_point(&self.end_location)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Matching,
    Matched,
    InProgress,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RideRequest {
    #[serde(alias = "_id")]
    pub id: RequestId,
    pub status: RequestStatus,
    #[serde(default)]
    pub rider_id: Option<UserId>,
    #[serde(default)]
    pub pickup_location: Option<Place>,
    #[serde(default)]
    pub dropoff_location: Option<Place>,
    #[serde(default)]
    pub requested_seats: Option<u32>,
    #[serde(default)]
    pub requested_pickup_time: Option<String>,
    #[serde(default)]
    pub matched_ride_id: Option<RideId>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub payment_status: Option<String>,
}

/// `GET /api/users/rides`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct UserRides {
    #[serde(default)]
    pub as_driver: Vec<Ride>,
    #[serde(default)]
    pub as_rider: Vec<Ride>,
    #[serde(default)]
    pub requests: Vec<RideRequest>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PoolRequestStatus {
    Pending,
    PrimaryRiderAccepted,
    RejectedByPrimaryRider,
    Accepted,
    RejectedByDriver,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl PoolRequestStatus {
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            PoolRequestStatus::Accepted
                | PoolRequestStatus::RejectedByPrimaryRider
                | PoolRequestStatus::RejectedByDriver
                | PoolRequestStatus::Cancelled
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PoolRideSummary {
    pub id: RideId,
    #[serde(default)]
    pub departure_time: Option<String>,
    pub status: RideStatus,
    #[serde(default)]
    pub driver: Option<PersonSummary>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PoolRequest {
    pub id: RequestId,
    pub status: PoolRequestStatus,
    pub pickup_location: Place,
    pub dropoff_location: Place,
    pub needed_seats: u32,
    pub created_at: String,
    #[serde(default)]
    pub ride: Option<PoolRideSummary>,
    #[serde(default)]
    pub primary_rider: Option<PersonSummary>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Counterparty {
    pub id: UserId,
    pub name: String,
    pub role: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Payment {
    pub payment_id: PaymentId,
    pub ride_request_id: RequestId,
    pub rider_id: UserId,
    #[serde(default)]
    pub driver_id: Option<UserId>,
    #[serde(default)]
    pub ride_id: Option<RideId>,
    pub amount: f64,
    pub payment_method: String,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub counterparty: Option<Counterparty>,
}

/// Result of `POST /api/payments`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PaymentReceipt {
    pub payment_id: PaymentId,
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct UserCounts {
    pub total: u64,
    pub drivers: u64,
    pub riders: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RideCounts {
    pub total: u64,
    pub active: u64,
    pub completed: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RequestCounts {
    pub total: u64,
    pub pending: u64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct PaymentTotals {
    pub total: u64,
    pub volume: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct AdminStats {
    pub users: UserCounts,
    pub rides: RideCounts,
    pub requests: RequestCounts,
    pub payments: PaymentTotals,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BadgeCategory {
    Level,
    Achievement,
    Special,
    #[serde(other)]
    Other,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Badge {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub earned_at: Option<String>,
    pub category: BadgeCategory,
}

/// `GET /api/drivers/badges`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BadgeCollection {
    pub badges: Vec<Badge>,
    pub total_badges: u32,
}

impl BadgeCollection {
    pub fn by_category(&self) -> BTreeMap<BadgeCategory, Vec<&Badge>> {
        let mut grouped: BTreeMap<BadgeCategory, Vec<&Badge>> = BTreeMap::new();
        for badge in &self.badges {
            grouped.entry(badge.category).or_default().push(badge);
        }
        grouped
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub driver_id: UserId,
    pub name: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
    pub points: i64,
    pub level: u32,
    #[serde(default)]
    pub is_you: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeaderboardPeriod {
    Week,
    Month,
    #[default]
    AllTime,
}

impl LeaderboardPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaderboardPeriod::Week => "week",
            LeaderboardPeriod::Month => "month",
            LeaderboardPeriod::AllTime => "all_time",
        }
    }
}

/// `GET /api/drivers/leaderboard`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Leaderboard {
    pub leaderboard: Vec<LeaderboardEntry>,
    #[serde(default)]
    pub user_rank: Option<u32>,
    #[serde(default)]
    pub user_entry: Option<LeaderboardEntry>,
    pub time_period: LeaderboardPeriod,
}

impl Leaderboard {
    /// The caller's row, whether or not it made the visible list.
    pub fn own_entry(&self) -> Option<&LeaderboardEntry> {
        self.leaderboard
            .iter()
            .find(|entry| entry.is_you)
            .or(self.user_entry.as_ref())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RatingRide {
    pub id: RideId,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Rating {
    pub id: String,
    pub rating: f64,
    #[serde(default)]
    pub comment: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub rater: Option<PersonSummary>,
    #[serde(default)]
    pub ride: Option<RatingRide>,
}

/// `GET /api/users/<id>/ratings`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UserRatings {
    pub user_id: UserId,
    pub average_rating: f64,
    pub total_ratings: u32,
    pub ratings: Vec<Rating>,
}

// --- Responses of the session endpoints ---

#[derive(Deserialize, Clone, Debug)]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RegisterResponse {
    pub user_id: UserId,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Acknowledgement {
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /api/ride-requests` returns the stored request plus candidate rides.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RideRequestCreated {
    pub request: RideRequest,
    #[serde(default)]
    pub matches: Vec<serde_json::Value>,
}

/// `POST /api/rides/<id>/request-pool`
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct PoolRequestCreated {
    pub request_id: RequestId,
    #[serde(default)]
    pub message: Option<String>,
}

// --- Request bodies ---

#[derive(Serialize, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Serialize, Clone)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub name: String,
    pub phone_number: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_info: Option<serde_json::Value>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("email", &self.email)
            .field("name", &self.name)
            .field("user_type", &self.user_type)
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Local checks mirroring the server's required fields.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.email.trim().is_empty() {
            return Some("email");
        }
        if self.password.is_empty() {
            return Some("password");
        }
        if self.name.trim().is_empty() {
            return Some("name");
        }
        if self.phone_number.trim().is_empty() {
            return Some("phone_number");
        }
        if self.user_type == UserType::Driver {
            if self.license_number.as_deref().unwrap_or_default().is_empty() {
                return Some("license_number");
            }
            if self.vehicle_info.is_none() {
                return Some("vehicle_info");
            }
        }
        None
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Default)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_info: Option<serde_json::Value>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RideDraft {
    pub start_location: [f64; 2],
    pub end_location: [f64; 2],
    pub departure_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_arrival_time: Option<String>,
    pub available_seats: u32,
    pub price_per_seat: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_polyline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

impl RideDraft {
    pub fn new(
        start: LatLon,
        end: LatLon,
        departure_time: impl Into<String>,
        available_seats: u32,
        price_per_seat: f64,
    ) -> Self {
        Self {
            start_location: start.to_lng_lat(),
            end_location: end.to_lng_lat(),
            departure_time: departure_time.into(),
            estimated_arrival_time: None,
            available_seats,
            price_per_seat,
            route_polyline: None,
            additional_info: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RideSearch {
    pub pickup_location: [f64; 2],
    pub dropoff_location: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<String>,
}

impl RideSearch {
    pub fn new(pickup: LatLon, dropoff: LatLon) -> Self {
        Self {
            pickup_location: pickup.to_lng_lat(),
            dropoff_location: dropoff.to_lng_lat(),
            radius_km: None,
            departure_time: None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RideRequestDraft {
    pub pickup_location: [f64; 2],
    pub dropoff_location: [f64; 2],
    pub requested_seats: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_pickup_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PoolRequestDraft {
    pub needed_seats: u32,
    pub pickup_location: [f64; 2],
    pub dropoff_location: [f64; 2],
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PoolAction {
    Accept,
    Reject,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PoolDecision {
    pub action: PoolAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PoolDecision {
    pub fn accept() -> Self {
        Self {
            action: PoolAction::Accept,
            reason: None,
        }
    }

    pub fn reject(reason: Option<String>) -> Self {
        Self {
            action: PoolAction::Reject,
            reason,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PaymentDraft {
    pub ride_request_id: RequestId,
    pub payment_method: String,
    pub amount: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct RatingDraft {
    pub rated_user_id: UserId,
    pub ride_id: RideId,
    pub rating: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ride_json() -> serde_json::Value {
        json!({
            "_id": "r1",
            "driver_id": "d1",
            "start_location": {"type": "Point", "coordinates": [-122.4194, 37.7749]},
            "end_location": {"type": "Point", "coordinates": [-122.2711, 37.8044]},
            "departure_time": "2025-03-01T08:30:00",
            "available_seats": 3,
            "price_per_seat": 12.5,
            "status": "active",
            "driver": {"id": "d1", "name": "Dana", "rating": 4.8, "phone_number": "555"}
        })
    }

    #[test]
    fn test_ride_decodes_geojson_points() {
        let ride: Ride = serde_json::from_value(ride_json()).unwrap();
        assert_eq!(ride.id, RideId::new("r1"));
        assert_eq!(ride.status, RideStatus::Active);

        let start = ride.start().unwrap();
        assert!((start.lat - 37.7749).abs() < f64::EPSILON);
        assert!((start.lon + 122.4194).abs() < f64::EPSILON);
        assert_eq!(ride.driver.unwrap().name, "Dana");
    }

    #[test]
    fn test_ride_missing_required_field_is_rejected() {
        let mut value = ride_json();
        value.as_object_mut().unwrap().remove("price_per_seat");
        assert!(serde_json::from_value::<Ride>(value).is_err());
    }

    #[test]
    fn test_unknown_status_does_not_fail_decoding() {
        let mut value = ride_json();
        value["status"] = json!("paused");
        let ride: Ride = serde_json::from_value(value).unwrap();
        assert_eq!(ride.status, RideStatus::Unknown);
    }

    #[test]
    fn test_lat_lon_validation() {
        assert!(LatLon::new(91.0, 0.0).is_none());
        assert!(LatLon::new(0.0, 181.0).is_none());
        assert!(LatLon::new(f64::NAN, 0.0).is_none());

        let point = LatLon::new(37.0, -122.0).unwrap();
        assert_eq!(point.to_lng_lat(), [-122.0, 37.0]);
        assert_eq!(LatLon::from_point(&point.to_point()), Some(point));
    }

    #[test]
    fn test_place_accepts_each_server_shape() {
        let point: Place =
            serde_json::from_value(json!({"type": "Point", "coordinates": [1.0, 2.0]})).unwrap();
        assert_eq!(point.lat_lon(), LatLon::new(2.0, 1.0));

        let pair: Place = serde_json::from_value(json!([1.0, 2.0])).unwrap();
        assert_eq!(pair.lat_lon(), LatLon::new(2.0, 1.0));

        let text: Place = serde_json::from_value(json!("Main St")).unwrap();
        assert_eq!(text.lat_lon(), None);
    }

    #[test]
    fn test_pool_request_decodes() {
        let request: PoolRequest = serde_json::from_value(json!({
            "id": "p1",
            "status": "primary_rider_accepted",
            "pickup_location": [1.0, 2.0],
            "dropoff_location": [3.0, 4.0],
            "needed_seats": 2,
            "created_at": "2025-03-01T08:00:00",
            "ride": {"id": "r1", "departure_time": null, "status": "active",
                     "driver": {"id": "d1", "name": "Dana", "vehicle_info": {}}},
            "primary_rider": {"id": "u2", "name": "Pat", "profile_picture": ""}
        }))
        .unwrap();
        assert_eq!(request.status, PoolRequestStatus::PrimaryRiderAccepted);
        assert!(!request.status.is_settled());
        assert_eq!(request.ride.unwrap().driver.unwrap().id, UserId::new("d1"));
    }

    #[test]
    fn test_leaderboard_own_entry_falls_back_to_user_entry() {
        let board: Leaderboard = serde_json::from_value(json!({
            "leaderboard": [
                {"rank": 1, "driver_id": "d1", "name": "Dana", "points": 900, "level": 4, "is_you": false}
            ],
            "user_rank": 14,
            "user_entry": {"rank": 14, "driver_id": "me", "name": "Me", "points": 20, "level": 1, "is_you": true},
            "time_period": "week"
        }))
        .unwrap();
        assert_eq!(board.time_period, LeaderboardPeriod::Week);
        assert_eq!(board.own_entry().unwrap().driver_id, UserId::new("me"));
    }

    #[test]
    fn test_badges_group_by_category() {
        let badges: BadgeCollection = serde_json::from_value(json!({
            "badges": [
                {"id": "level_2_badge", "name": "Bronze", "description": "Reached level 2", "category": "level"},
                {"id": "elite_driver", "name": "Elite Driver", "description": "10k points", "category": "special"},
                {"id": "level_3_badge", "name": "Silver", "description": "Reached level 3", "category": "level"}
            ],
            "total_badges": 3
        }))
        .unwrap();
        let grouped = badges.by_category();
        assert_eq!(grouped[&BadgeCategory::Level].len(), 2);
        assert_eq!(grouped[&BadgeCategory::Special].len(), 1);
    }

    #[test]
    fn test_registration_required_fields() {
        let mut registration = Registration {
            email: "d@example.com".into(),
            password: "pw".into(),
            name: "Dana".into(),
            phone_number: "555".into(),
            user_type: UserType::Driver,
            license_number: None,
            vehicle_info: None,
        };
        assert_eq!(registration.missing_field(), Some("license_number"));

        registration.license_number = Some("L-1".into());
        registration.vehicle_info = Some(json!({"make": "Toyota"}));
        assert_eq!(registration.missing_field(), None);

        let body = serde_json::to_value(&registration).unwrap();
        assert_eq!(body["user_type"], "driver");
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            email: "user@example.com".into(),
            password: "secret".into(),
        };
        assert!(!format!("{credentials:?}").contains("secret"));
    }
}
