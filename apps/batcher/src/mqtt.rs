use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, TlsConfiguration, Transport};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{BusEvent, EventBus};
use crate::config::MqttConfig;
use crate::task::Task;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub fn topic_filter(cfg: &MqttConfig) -> String {
    if let Some(topic) = cfg.topic.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return topic.to_string();
    }
    match cfg.partition {
        Some(partition) => format!("projects/{partition}/+/data"),
        None => "projects/+/data".to_string(),
    }
}

fn qos_level(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn client_options(cfg: &MqttConfig) -> Result<MqttOptions> {
    // A fresh client id per process keeps half-dead sessions on the broker
    // from stealing our subscription after a crash.
    let client_id = format!("batcher-{}", Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    if let Some(ca_file) = &cfg.ca_file {
        let ca = std::fs::read(ca_file)
            .with_context(|| format!("reading broker CA {}", ca_file.display()))?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }
    Ok(options)
}

/// Broker reader. Connects, subscribes, and publishes every inbound frame to
/// the bus as a task; reconnects forever until cancelled. `ready` resolves
/// after the first successful subscribe so startup can fail fast when the
/// broker is unreachable.
pub async fn run(
    cfg: MqttConfig,
    bus: Arc<EventBus<BusEvent>>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) -> Result<()> {
    let filter = topic_filter(&cfg);
    let qos = qos_level(cfg.qos);
    let mut ready = Some(ready);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let options = client_options(&cfg)?;
        let (client, mut eventloop) = AsyncClient::new(options, 32);

        match client.subscribe(filter.clone(), qos).await {
            Ok(()) => {
                tracing::info!(topic = %filter, qos = cfg.qos, "subscribed to telemetry feed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe, retrying");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("stopping mqtt client");
                    let _ = client.unsubscribe(filter.clone()).await;
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        tracing::info!(topic = %filter, "connected to broker");
                        if let Some(ready) = ready.take() {
                            let _ = ready.send(());
                        }
                        bus.publish(BusEvent::BrokerStatus { connected: true });
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        tracing::debug!(
                            topic = %publish.topic,
                            payload_bytes = publish.payload.len(),
                            "frame received"
                        );
                        bus.publish(BusEvent::Task(Task::new(publish.payload.to_vec())));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "broker connection dropped, reconnecting");
                        bus.publish(BusEvent::BrokerStatus { connected: false });
                        break;
                    }
                }
            }
        }

        sleep(RECONNECT_DELAY).await;
    }
}
