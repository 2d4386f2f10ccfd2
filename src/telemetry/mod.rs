//! Per-device telemetry stream state.
//!
//! A device can feed two telemetry sinks at once: the live WebSocket stream
//! consumed by the admin UI, and the event-bus (broker) stream. The gateway
//! only tracks delivery parameters and counters here; the sinks themselves
//! live outside the core.

/// One telemetry sink's delivery state.
#[derive(Debug, Clone, Default)]
pub struct TelemetryStream {
    pub running: bool,
    /// Reporting interval requested of the device, in seconds.
    pub interval: u64,
    /// Epoch second after which the stream expires.
    pub deadline: u64,
    pub packets: u64,
    pub bytes: u64,
    /// Telemetry types the subscriber asked for (empty = all).
    pub types: Vec<String>,
}

impl TelemetryStream {
    pub fn start(&mut self, interval: u64, lifetime: u64, types: Vec<String>, now: u64) {
        self.running = true;
        self.interval = interval;
        self.deadline = now + lifetime;
        self.types = types;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.interval = 0;
        self.deadline = 0;
        self.types.clear();
    }

    /// Account one delivered payload.
    pub fn record(&mut self, bytes: u64) {
        self.packets += 1;
        self.bytes += bytes;
    }

    pub fn expired(&self, now: u64) -> bool {
        self.running && self.deadline != 0 && now > self.deadline
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryState {
    pub websocket: TelemetryStream,
    pub kafka: TelemetryStream,
}

impl TelemetryState {
    pub fn running(&self) -> bool {
        self.websocket.running || self.kafka.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_lifecycle() {
        let mut s = TelemetryStream::default();
        s.start(5, 600, vec!["wifi-frames".into()], 1_000);
        assert!(s.running);
        assert_eq!(s.deadline, 1_600);
        assert!(!s.expired(1_600));
        assert!(s.expired(1_601));

        s.record(128);
        s.record(64);
        assert_eq!(s.packets, 2);
        assert_eq!(s.bytes, 192);

        s.stop();
        assert!(!s.running);
        assert!(!s.expired(2_000));
        // Counters survive a stop for reporting.
        assert_eq!(s.packets, 2);
    }
}
