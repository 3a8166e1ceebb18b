use super::*;

/// A scheduled stop on a train's route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStop {
    pub station_name: String,
    #[serde(default)]
    pub station_order: u32,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lon: f64,
    #[serde(default)]
    pub distance_from_previous_km: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Train {
    pub train_id: String,
    #[serde(default)]
    pub train_type: TrainType,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub route: Vec<RouteStop>,
    #[serde(default)]
    pub route_index: usize,
    #[serde(default)]
    pub status: TrainStatus,
    #[serde(default)]
    pub current_position_type: PositionType,
    #[serde(default)]
    pub current_station: Option<String>,
    #[serde(default)]
    pub current_edge: Option<String>,
    #[serde(default)]
    pub progress_on_edge: f64,
    #[serde(default)]
    pub current_speed_kmh: f64,
    #[serde(default)]
    pub delay_seconds: u32,
}

fn default_priority() -> u8 {
    1
}

impl Train {
    /// Name of the next route stop, if the route has one.
    pub fn next_station(&self) -> Option<&str> {
        if self.route_index + 1 < self.route.len() {
            Some(self.route[self.route_index + 1].station_name.as_str())
        } else {
            None
        }
    }

    pub fn is_at_final_stop(&self) -> bool {
        !self.route.is_empty() && self.route_index + 1 >= self.route.len()
    }

    pub fn is_delayed(&self) -> bool {
        self.delay_seconds > 0
    }

    /// Reset the train to the start of its route, ready for spawning.
    pub fn place_at_origin(&mut self) {
        if let Some(first) = self.route.first() {
            self.current_position_type = PositionType::Station;
            self.current_station = Some(first.station_name.clone());
            self.current_edge = None;
            self.progress_on_edge = 0.0;
            self.route_index = 0;
            self.status = TrainStatus::OnTime;
            self.delay_seconds = 0;
            self.current_speed_kmh = 0.0;
        }
    }
}
