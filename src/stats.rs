use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

const WINDOW: Duration = Duration::from_secs(60);

/// Receives a record of every outbound request.
pub trait StatsSink: Debug + Send + Sync {
    fn record_request(&self, service: &str, at: SystemTime);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn record_request(&self, _service: &str, _at: SystemTime) {}
}

/// Counts outbound requests per service over the trailing minute.
#[derive(Debug, Default)]
pub struct RequestCounter {
    requests: Mutex<HashMap<String, VecDeque<SystemTime>>>,
}

impl RequestCounter {
    pub fn new() -> Self {
        RequestCounter::default()
    }

    pub fn requests_last_minute(&self) -> HashMap<String, usize> {
        self.requests_last_minute_at(SystemTime::now())
    }

    pub fn requests_last_minute_at(&self, now: SystemTime) -> HashMap<String, usize> {
        let mut requests = self.requests.lock();
        let since = now.checked_sub(WINDOW).unwrap_or(SystemTime::UNIX_EPOCH);
        requests.retain(|_, timestamps| {
            while matches!(timestamps.front(), Some(at) if *at < since) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
        requests
            .iter()
            .map(|(service, timestamps)| (service.clone(), timestamps.len()))
            .collect()
    }
}

impl StatsSink for RequestCounter {
    fn record_request(&self, service: &str, at: SystemTime) {
        self.requests
            .lock()
            .entry(service.to_string())
            .or_default()
            .push_back(at);
    }
}
