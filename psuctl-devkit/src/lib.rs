/*!
Devkit psuctl

Facilite le développement des intégrations compagnes du daemon (shim côté
hôte d'impression, dashboards, backends délégués) sans broker MQTT réel :
- MockMqttClient : enregistre les publications et simule les réceptions
- PsuMessageBuilder : messages conformes aux topics psuctl/...@v1
*/

pub mod mqtt_stub;

pub use mqtt_stub::{MockMessage, MockMqttClient, PsuMessageBuilder};
