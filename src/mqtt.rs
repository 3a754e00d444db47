use crate::config::Config;
use crate::pipeline::{Batch, PipelineHandle};
use crate::record::decode_batch;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

/// Consumes `<prefix>/<device>/weather` publishes and feeds them to the
/// pipeline. Delivery is at-least-once; the ingestor deduplicates.
pub async fn run_listener(config: Config, pipeline: PipelineHandle) -> Result<()> {
    let weather_filter = format!("{}/+/weather", config.mqtt_topic_prefix);
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);

        match client
            .subscribe(weather_filter.clone(), QoS::AtLeastOnce)
            .await
        {
            Ok(_) => {
                tracing::info!(topic = %weather_filter, "subscribed to weather feed");
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to subscribe to MQTT; retrying");
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match parse_weather_publish(&config.mqtt_topic_prefix, &publish.topic, &mut payload) {
                        Ok(Some(batch)) if batch.is_empty() => {}
                        Ok(Some(batch)) => {
                            if let Err(err) = pipeline.submit(batch).await {
                                tracing::error!(error = %err, "failed to queue MQTT batch");
                                return Err(err);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, topic = %publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

/// `Ok(None)` for topics outside `<prefix>/<device>/weather`.
pub fn parse_weather_publish(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<Batch>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 3 || parts[0] != topic_prefix || parts[2] != "weather" {
        return Ok(None);
    }
    Ok(Some(decode_batch(payload)?))
}
