use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info};

/// Wall-clock stopwatch for a single named stage of the pipeline.
pub struct Timer {
    stage: String,
    started: Option<DateTime<Utc>>,
    elapsed: Option<TimeDelta>,
}

impl Timer {
    /// Create a timer that is already running
    pub fn new_start(stage: &str) -> Self {
        debug!("{}: starting", stage);

        Timer {
            stage: stage.to_owned(),
            started: Some(Utc::now()),
            elapsed: None,
        }
    }

    /// Stop the timer and return the elapsed milliseconds.
    ///
    /// Stopping twice keeps the first measurement.
    pub fn stop(&mut self) -> i64 {
        if let Some(started) = self.started.take() {
            let d = Utc::now() - started;
            info!("{} took {} msec", self.stage, d.num_milliseconds());
            self.elapsed = Some(d);
        }

        self.millis()
    }

    /// Elapsed milliseconds, zero while still running
    pub fn millis(&self) -> i64 {
        self.elapsed.map_or(0, |d| d.num_milliseconds())
    }
}
