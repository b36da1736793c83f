//! MQTT Transport
//!
//! Opens MQTT 3.1.1 sessions with `rumqttc`. Each session gets its own
//! event loop task that translates broker packets into [`TransportEvent`]s.
//! The event loop stops at the first connection error instead of letting
//! `rumqttc` retry, so the feed's reconnect policy stays in charge.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport as Wire,
};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use super::{Session, SessionHandle, Transport, TransportError, TransportEvent};
use crate::config::BrokerConfig;

/// Capacity of the request queue between `AsyncClient` and its event loop
const REQUEST_CAPACITY: usize = 10;

/// How long `close` waits for the DISCONNECT to be flushed
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// MQTT broker transport
pub struct MqttTransport {
    config: BrokerConfig,
}

impl MqttTransport {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Build `rumqttc` options for a client id from the broker URL
    fn mqtt_options(&self, client_id: &str) -> Result<MqttOptions, TransportError> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{}: {}", self.config.url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{}: no host", url)))?
            .to_string();

        let (mut options, wire) = match url.scheme() {
            // WebSocket transports take the whole URL as the address
            "wss" => (
                MqttOptions::new(client_id, url.as_str(), url.port_or_known_default().unwrap_or(443)),
                Wire::wss_with_default_config(),
            ),
            "ws" => (
                MqttOptions::new(client_id, url.as_str(), url.port_or_known_default().unwrap_or(80)),
                Wire::Ws,
            ),
            "mqtts" | "ssl" => (
                MqttOptions::new(client_id, host, url.port().unwrap_or(8883)),
                Wire::tls_with_default_config(),
            ),
            "mqtt" | "tcp" => (
                MqttOptions::new(client_id, host, url.port().unwrap_or(1883)),
                Wire::Tcp,
            ),
            other => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };

        options
            .set_keep_alive(self.config.keep_alive())
            .set_clean_session(true)
            .set_transport(wire);

        Ok(options)
    }
}

impl Transport for MqttTransport {
    fn open(&self, client_id: &str) -> Result<Session, TransportError> {
        let options = self.mqtt_options(client_id)?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(
            broker = %self.config.url,
            client_id = %client_id,
            "Opening MQTT session"
        );

        let pump = tokio::spawn(pump_events(eventloop, tx, self.config.connect_timeout()));

        Ok(Session {
            events: rx,
            handle: Box::new(MqttSession {
                client,
                pump: Mutex::new(Some(pump)),
            }),
        })
    }
}

/// Drive one `rumqttc` event loop until the session ends
async fn pump_events(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout: Duration,
) {
    match tokio::time::timeout(connect_timeout, wait_for_connack(&mut eventloop)).await {
        Ok(Ok(())) => {
            let _ = events.send(TransportEvent::Connected);
        }
        Ok(Err(e)) => {
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::Closed);
            return;
        }
        Err(_) => {
            let err = TransportError::ConnectTimeout(connect_timeout);
            let _ = events.send(TransportEvent::Error(err.to_string()));
            let _ = events.send(TransportEvent::Closed);
            return;
        }
    }

    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    tracing::debug!(pkid = ack.pkid, "SUBACK carried a failure code");
                    Some(TransportEvent::SubscribeFailed {
                        topic: format!("pkid {}", ack.pkid),
                    })
                } else {
                    None
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => Some(TransportEvent::Disconnected),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(TransportEvent::Closed);
                return;
            }
            Ok(_) => None,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                let _ = events.send(TransportEvent::Closed);
                return;
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                tracing::debug!("Session receiver dropped, stopping event loop");
                return;
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    fn take_pump(&self) -> Option<JoinHandle<()>> {
        self.pump.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl SessionHandle for MqttSession {
    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "DISCONNECT not queued");
        }

        if let Some(mut pump) = self.take_pump() {
            if tokio::time::timeout(CLOSE_GRACE, &mut pump).await.is_err() {
                pump.abort();
            }
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(url: &str) -> MqttTransport {
        MqttTransport::new(BrokerConfig {
            url: url.to_string(),
            ..BrokerConfig::default()
        })
    }

    #[test]
    fn test_wss_url_keeps_full_address() {
        let options = transport("wss://test.mosquitto.org:8081/mqtt")
            .mqtt_options("client-1")
            .unwrap();
        let (host, port) = options.broker_address();
        assert_eq!(host, "wss://test.mosquitto.org:8081/mqtt");
        assert_eq!(port, 8081);
        assert_eq!(options.client_id(), "client-1");
        assert!(options.clean_session());
    }

    #[test]
    fn test_plain_mqtt_url() {
        let options = transport("mqtt://localhost").mqtt_options("c").unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));

        let options = transport("mqtts://broker.local:9000").mqtt_options("c").unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 9000));
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(
            transport("not a url").mqtt_options("c"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            transport("http://example.com").mqtt_options("c"),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_url_without_spawning() {
        assert!(transport("ftp://example.com").open("c").is_err());
    }

    #[tokio::test]
    async fn test_silent_broker_hits_connect_timeout() {
        // Accepts TCP but never answers CONNECT
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let transport = MqttTransport::new(BrokerConfig {
            url: format!("mqtt://127.0.0.1:{}", port),
            connect_timeout_ms: 300,
            ..BrokerConfig::default()
        });
        let mut session = transport.open("silent-client").unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), session.events.recv())
            .await
            .unwrap();
        match first {
            Some(TransportEvent::Error(message)) => {
                assert!(message.contains("300ms"), "{}", message)
            }
            other => panic!("expected a timeout error, got {:?}", other),
        }
        let second = tokio::time::timeout(Duration::from_secs(1), session.events.recv())
            .await
            .unwrap();
        assert_eq!(second, Some(TransportEvent::Closed));
    }
}
