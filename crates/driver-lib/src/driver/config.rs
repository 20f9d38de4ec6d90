use std::time::Duration;

/// Configuration for a workload driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Simulated length of one tick (default: 60 seconds)
    pub tick_duration: chrono::Duration,
    /// Real time per simulated time; 0.5 runs twice as fast (default: 1.0)
    pub timescale_adjustment_factor: f64,
    /// Issue ticks from the driver itself rather than an external trigger
    pub perform_clock_ticks: bool,
    /// Inbound buffer of each session client
    pub client_channel_capacity: usize,
    /// Number of ticks in the moving average used to spot long ticks
    pub tick_window_size: usize,
    /// Fixed part of the wait for a backend training acknowledgement
    pub training_timeout_base: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_duration: chrono::Duration::seconds(60),
            timescale_adjustment_factor: 1.0,
            perform_clock_ticks: true,
            client_channel_capacity: 1024,
            tick_window_size: 16,
            training_timeout_base: Duration::from_secs(60),
        }
    }
}

impl DriverConfig {
    /// Wall-clock equivalent of a simulated duration
    pub fn adjusted(&self, simulated: chrono::Duration) -> Duration {
        simulated
            .to_std()
            .unwrap_or_default()
            .mul_f64(self.timescale_adjustment_factor.max(0.0))
    }

    /// Bound on waiting for a training start or stop acknowledgement
    pub fn training_timeout(&self, training_duration: chrono::Duration) -> Duration {
        self.training_timeout_base + self.adjusted(training_duration)
    }
}
