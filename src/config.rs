use core::default::Default;
use core::time::Duration;

/// Postman transport config
#[derive(Debug, Clone, Builder, Getters)]
#[builder(default, setter(into))]
pub struct Config {
    /// AMQP URI of the broker.
    #[get = "pub"]
    pub(crate) uri: String,
    /// Name of the service this instance serves requests for.
    #[get = "pub"]
    pub(crate) service_name: String,
    /// Deadline applied by [`Transport::call`](crate::Transport::call).
    #[get = "pub"]
    pub(crate) call_timeout: Duration,
    /// Tick of the pending call reaper.
    #[get = "pub"]
    pub(crate) reaper_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            uri: "amqp://127.0.0.1:5672/%2f".to_string(),
            service_name: "postman".to_string(),
            call_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_millis(100),
        }
    }
}
