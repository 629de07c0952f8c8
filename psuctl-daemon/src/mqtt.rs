use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tracing::{debug, error, warn};

use crate::config::PsuConfig;
use crate::controller::{PsuController, QueuingVerdict};
use crate::models::{HostEventIn, QueuingIn, QueuingVerdictOut};
use crate::printer::{MqttPrinterBridge, PrinterResponse, RESPONSE_TOPIC};

pub const QUEUING_TOPIC: &str = "psuctl/printer/queuing@v1";
pub const QUEUING_VERDICT_TOPIC: &str = "psuctl/printer/queuing/verdict@v1";
pub const HOST_EVENT_TOPIC: &str = "psuctl/host/event@v1";

pub fn create_mqtt_client(cfg: &PsuConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new("psuctl-daemon", &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 64)
}

/// Écoute le flux G-code, les réponses imprimante et les événements hôte.
pub fn spawn_mqtt_listener(
    controller: Arc<PsuController>,
    bridge: Arc<MqttPrinterBridge>,
    client: AsyncClient,
    mut eventloop: EventLoop,
) {
    tokio::spawn(async move {
        for topic in [QUEUING_TOPIC, RESPONSE_TOPIC, HOST_EVENT_TOPIC] {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("subscribe MQTT failed for {}: {:?}", topic, e);
                return;
            }
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let Ok(txt) = String::from_utf8(p.payload.to_vec()) else {
                        warn!("payload non UTF-8 sur {}", p.topic);
                        continue;
                    };
                    match p.topic.as_str() {
                        QUEUING_TOPIC => match serde_json::from_str::<QueuingIn>(&txt) {
                            Ok(msg) => {
                                let out = match controller.observe_gcode(&msg.line) {
                                    QueuingVerdict::Drop => QueuingVerdictOut {
                                        id: msg.id,
                                        action: "drop",
                                        log: Some("PSU Control: ok".into()),
                                    },
                                    QueuingVerdict::Pass => QueuingVerdictOut {
                                        id: msg.id,
                                        action: "pass",
                                        log: None,
                                    },
                                };
                                match serde_json::to_string(&out) {
                                    Ok(body) => {
                                        if let Err(e) = client
                                            .publish(
                                                QUEUING_VERDICT_TOPIC,
                                                QoS::AtLeastOnce,
                                                false,
                                                body,
                                            )
                                            .await
                                        {
                                            error!("failed to publish verdict: {:?}", e);
                                        }
                                    }
                                    Err(e) => error!("failed to encode verdict: {}", e),
                                }
                            }
                            Err(_) => warn!("queuing JSON invalide: {txt}"),
                        },
                        RESPONSE_TOPIC => match serde_json::from_str::<PrinterResponse>(&txt) {
                            Ok(resp) => bridge.handle_response(resp),
                            Err(_) => warn!("printer response JSON invalide: {txt}"),
                        },
                        HOST_EVENT_TOPIC => match serde_json::from_str::<HostEventIn>(&txt) {
                            Ok(ev) => {
                                debug!("host event {} {:?}", ev.event, ev.payload);
                                controller.on_host_event(&ev.event).await;
                            }
                            Err(_) => warn!("host event JSON invalide: {txt}"),
                        },
                        _ => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT erreur: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}
