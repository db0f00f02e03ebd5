/// Speaking/silent decision with hysteresis.
///
/// Engages when the level rises above `threshold_db` and releases once it
/// falls to `threshold_db - hysteresis_db` or below.
#[derive(Debug, Clone)]
pub struct ActivityClassifier {
    threshold_db: f64,
    hysteresis_db: f64,
    speaking: bool,
}

impl ActivityClassifier {
    pub fn new(threshold_db: f64, hysteresis_db: f64) -> Self {
        Self {
            threshold_db,
            hysteresis_db: hysteresis_db.max(0.0),
            speaking: false,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one reading. Returns the new state only when it changed.
    pub fn classify(&mut self, decibels: f64) -> Option<bool> {
        let next = if self.speaking {
            decibels > self.threshold_db - self.hysteresis_db
        } else {
            decibels > self.threshold_db
        };
        if next == self.speaking {
            return None;
        }
        self.speaking = next;
        Some(next)
    }

    pub fn reset(&mut self) {
        self.speaking = false;
    }
}
