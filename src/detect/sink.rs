//! Detection event sinks.

use std::sync::Arc;
use std::thread;

use thiserror::Error;
use tracing::{info, warn};

use super::DetectionEvent;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event queue full")]
    QueueFull,

    #[error("event sink closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Receiver of detection events.
///
/// `publish` is fire-and-forget: callers log a returned error and move on,
/// they never retry.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &DetectionEvent) -> Result<(), SinkError>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &DetectionEvent) -> Result<(), SinkError> {
        info!(
            camera = %event.camera,
            label = %event.label,
            confidence = event.confidence,
            "detection"
        );
        Ok(())
    }
}

/// Moves publication off the caller's thread.
///
/// Events go through a bounded queue to a worker thread that forwards them to
/// the inner sink. A full queue drops the event instead of waiting.
pub struct QueuedSink {
    tx: flume::Sender<DetectionEvent>,
}

impl QueuedSink {
    pub fn spawn(inner: Arc<dyn EventSink>, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = flume::bounded::<DetectionEvent>(capacity.max(1));

        thread::Builder::new()
            .name("event-sink".into())
            .spawn(move || {
                // Ends once every sender is gone.
                for event in rx.iter() {
                    if let Err(e) = inner.publish(&event) {
                        warn!("Event publish failed for camera {}: {}", event.camera, e);
                    }
                }
            })?;

        Ok(Self { tx })
    }
}

impl EventSink for QueuedSink {
    fn publish(&self, event: &DetectionEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            flume::TrySendError::Full(_) => {
                metrics::counter!("events_dropped").increment(1);
                SinkError::QueueFull
            }
            flume::TrySendError::Disconnected(_) => SinkError::Closed,
        })
    }
}

#[cfg(feature = "mqtt")]
pub use mqtt::MqttSink;

#[cfg(feature = "mqtt")]
mod mqtt {
    use std::thread;
    use std::time::Duration;

    use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
    use tracing::{debug, info, warn};

    use super::{EventSink, SinkError};
    use crate::detect::DetectionEvent;
    use crate::MqttConfig;

    /// Publishes events as JSON with QoS 0.
    pub struct MqttSink {
        client: Client,
        topic: String,
    }

    impl MqttSink {
        pub fn connect(config: &MqttConfig) -> Result<Self, SinkError> {
            let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
            options.set_keep_alive(Duration::from_secs(60));

            let (client, mut connection) = Client::new(options, 16);
            let broker = format!("{}:{}", config.host, config.port);

            thread::Builder::new()
                .name("mqtt-events".into())
                .spawn(move || {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                info!("[MQTT] Connected to {}", broker);
                            }
                            Ok(event) => debug!("[MQTT] {:?}", event),
                            Err(e) => {
                                warn!("[MQTT] connection error: {}", e);
                                thread::sleep(Duration::from_secs(1));
                            }
                        }
                    }
                })
                .map_err(|e| SinkError::Transport(e.to_string()))?;

            Ok(Self {
                client,
                topic: config.topic.clone(),
            })
        }
    }

    impl EventSink for MqttSink {
        fn publish(&self, event: &DetectionEvent) -> Result<(), SinkError> {
            let payload = serde_json::to_vec(event)?;
            self.client
                .try_publish(self.topic.as_str(), QoS::AtMostOnce, false, payload)
                .map_err(|e| SinkError::Transport(e.to_string()))
        }
    }
}
