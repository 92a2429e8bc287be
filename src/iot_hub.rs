use std::{fmt, str::FromStr, time::Duration};

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use serde::Serialize;
use sha2::Sha256;
use url::form_urlencoded;

pub const MQTT_PORT: u16 = 8883;
pub const API_VERSION: &str = "2021-04-12";
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const SAS_TOKEN_TTL: Duration = Duration::from_secs(3600);

const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// `HostName=<hub>.azure-devices.net;DeviceId=<id>;SharedAccessKey=<base64>`
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub shared_access_key: String,
    pub shared_access_key_name: Option<String>,
}

impl ConnectionString {
    pub fn client_id(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!("{}/{}", self.device_id, module_id),
            None => self.device_id.clone(),
        }
    }

    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                self.host_name, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }

    pub fn username(&self) -> String {
        format!(
            "{}/{}/?api-version={}",
            self.host_name,
            self.client_id(),
            API_VERSION
        )
    }

    pub fn events_topic(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "devices/{}/modules/{}/messages/events/",
                self.device_id, module_id
            ),
            None => format!("devices/{}/messages/events/", self.device_id),
        }
    }

    /// Session options for one connection; the SAS token is minted here.
    pub fn mqtt_options(&self, device: &DeviceOptions) -> Result<MqttOptions, anyhow::Error> {
        let expiry = Utc::now().timestamp() + SAS_TOKEN_TTL.as_secs() as i64;
        let password = sas_token(
            &self.resource_uri(),
            &self.shared_access_key,
            expiry,
            self.shared_access_key_name.as_deref(),
        )?;

        let mut options = MqttOptions::new(self.client_id(), self.host_name.clone(), device.port);
        options.set_credentials(self.username(), password);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if device.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        Ok(options)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    pub port: u16,
    pub tls: bool,
    pub operation_timeout: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        DeviceOptions {
            port: MQTT_PORT,
            tls: true,
            operation_timeout: OPERATION_TIMEOUT,
        }
    }
}

impl FromStr for ConnectionString {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut module_id = None;
        let mut shared_access_key = None;
        let mut shared_access_key_name = None;

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .with_context(|| format!("Invalid connection string segment: {part}"))?;
            let value = value.trim().to_string();
            match key.trim() {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "ModuleId" => module_id = Some(value),
                "SharedAccessKey" => shared_access_key = Some(value),
                "SharedAccessKeyName" => shared_access_key_name = Some(value),
                "x509" if value.eq_ignore_ascii_case("true") => {
                    return Err(anyhow::anyhow!(
                        "X.509 authenticated connection strings are not supported"
                    ));
                }
                other => log::debug!("Ignoring connection string key {other}"),
            }
        }

        let required = |value: Option<String>, name: &str| {
            value
                .filter(|v| !v.is_empty())
                .with_context(|| format!("Connection string is missing {name}"))
        };

        Ok(ConnectionString {
            host_name: required(host_name, "HostName")?,
            device_id: required(device_id, "DeviceId")?,
            module_id: module_id.filter(|v| !v.is_empty()),
            shared_access_key: required(shared_access_key, "SharedAccessKey")?,
            shared_access_key_name: shared_access_key_name.filter(|v| !v.is_empty()),
        })
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("host_name", &self.host_name)
            .field("device_id", &self.device_id)
            .field("module_id", &self.module_id)
            .field("shared_access_key", &"<redacted>")
            .field("shared_access_key_name", &self.shared_access_key_name)
            .finish()
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// `expiry` is in unix seconds.
pub fn sas_token(
    resource_uri: &str,
    key: &str,
    expiry: i64,
    key_name: Option<&str>,
) -> Result<String, anyhow::Error> {
    let key = STANDARD
        .decode(key)
        .context("Shared access key is not valid base64")?;
    let resource = encode(resource_uri);

    let mut mac =
        Hmac::<Sha256>::new_from_slice(&key).context("Failed to initialize HMAC-SHA256")?;
    mac.update(format!("{resource}\n{expiry}").as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource,
        encode(&signature),
        expiry
    );
    if let Some(name) = key_name {
        token.push_str("&skn=");
        token.push_str(&encode(name));
    }

    Ok(token)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    body: Vec<u8>,
    message_id: Option<String>,
    content_type: Option<String>,
    content_encoding: Option<String>,
}

impl Message {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Message {
            body: body.into(),
            message_id: None,
            content_type: None,
            content_encoding: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, anyhow::Error> {
        let body = serde_json::to_vec_pretty(value).context("Failed to serialize message body")?;

        Ok(Message::new(body)
            .with_content_type("application/json")
            .with_content_encoding("utf-8"))
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Appended to the events topic. `+` is an MQTT wildcard, so spaces are
    /// sent as `%20`.
    pub fn property_string(&self) -> String {
        let mut props = Vec::new();
        if let Some(mid) = &self.message_id {
            props.push(format!("$.mid={}", encode(mid).replace('+', "%20")));
        }
        if let Some(ct) = &self.content_type {
            props.push(format!("$.ct={}", encode(ct)));
        }
        if let Some(ce) = &self.content_encoding {
            props.push(format!("$.ce={}", encode(ce)));
        }
        props.join("&")
    }
}

/// One MQTT session with IoT Hub. Connect, send, then `shutdown`.
pub struct DeviceClient {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
    operation_timeout: Duration,
}

impl DeviceClient {
    pub async fn connect(
        connection_string: &ConnectionString,
        device: &DeviceOptions,
    ) -> Result<Self, anyhow::Error> {
        let options = connection_string.mqtt_options(device)?;
        let client = DeviceClient::connect_with(
            options,
            connection_string.events_topic(),
            device.operation_timeout,
        )
        .await?;
        log::debug!("Connected to IoT Hub {}", connection_string.host_name);

        Ok(client)
    }

    pub async fn connect_with(
        options: MqttOptions,
        topic: String,
        operation_timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let mut device = DeviceClient {
            client,
            eventloop,
            topic,
            operation_timeout,
        };

        tokio::time::timeout(operation_timeout, device.wait_for_connack())
            .await
            .context("Timed out waiting for IoT Hub CONNACK")??;

        Ok(device)
    }

    async fn wait_for_connack(&mut self) -> Result<(), anyhow::Error> {
        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .context("Failed to connect to IoT Hub")?;
            if let Event::Incoming(Packet::ConnAck(_)) = event {
                return Ok(());
            }
            log::trace!("mqtt event: {event:?}");
        }
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<(), anyhow::Error> {
        let topic = format!("{}{}", self.topic, message.property_string());
        self.client
            .publish(topic, QoS::AtLeastOnce, false, message.body().to_vec())
            .await
            .context("Failed to queue message for IoT Hub")?;

        tokio::time::timeout(self.operation_timeout, self.wait_for_puback())
            .await
            .context("Timed out waiting for IoT Hub PUBACK")?
    }

    async fn wait_for_puback(&mut self) -> Result<(), anyhow::Error> {
        loop {
            let event = self
                .eventloop
                .poll()
                .await
                .context("Failed to send message to IoT Hub")?;
            if let Event::Incoming(Packet::PubAck(ack)) = &event {
                log::debug!("IoT Hub acknowledged message pkid={}", ack.pkid);
                return Ok(());
            }
            log::trace!("mqtt event: {event:?}");
        }
    }

    /// Failures are only logged.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Failed to request IoT Hub disconnect: {e}");
            return;
        }

        let operation_timeout = self.operation_timeout;
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(event) => log::trace!("mqtt event: {event:?}"),
                    Err(e) => {
                        log::debug!("IoT Hub connection closed: {e}");
                        break;
                    }
                }
            }
        };
        if tokio::time::timeout(operation_timeout, drain).await.is_err() {
            log::warn!("Timed out closing IoT Hub connection");
        }
    }
}


/// Single-connection MQTT 3.1.1 broker that records what a client sends.
#[cfg(test)]
pub(crate) mod test_broker {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Ack {
        Accept,
        Withhold,
        Refuse,
    }

    #[derive(Debug, Default)]
    pub(crate) struct Session {
        pub client_id: String,
        pub username: String,
        pub password: String,
        pub publishes: Vec<(String, Vec<u8>)>,
        pub disconnected: bool,
    }

    const CONNECT: u8 = 1;
    const PUBLISH: u8 = 3;
    const PINGREQ: u8 = 12;
    const DISCONNECT: u8 = 14;

    pub(crate) async fn spawn(ack: Ack) -> (u16, JoinHandle<Session>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut session = Session::default();

            while let Ok(Some((header, body))) = read_packet(&mut stream).await {
                match header >> 4 {
                    CONNECT => {
                        read_connect(&body, &mut session);
                        if ack == Ack::Refuse {
                            // not authorized
                            stream.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
                            break;
                        }
                        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                    }
                    PUBLISH => {
                        let qos = (header >> 1) & 0x03;
                        let mut at = 0;
                        let topic = read_str(&body, &mut at);
                        let pkid = if qos > 0 {
                            at += 2;
                            Some([body[at - 2], body[at - 1]])
                        } else {
                            None
                        };
                        session.publishes.push((topic, body[at..].to_vec()));
                        if let (Some([hi, lo]), Ack::Accept) = (pkid, ack) {
                            stream.write_all(&[0x40, 0x02, hi, lo]).await.unwrap();
                        }
                    }
                    PINGREQ => stream.write_all(&[0xd0, 0x00]).await.unwrap(),
                    DISCONNECT => {
                        session.disconnected = true;
                        break;
                    }
                    _ => {}
                }
            }

            session
        });

        (port, handle)
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<Option<(u8, Vec<u8>)>> {
        let mut header = [0u8; 1];
        if stream.read(&mut header).await? == 0 {
            return Ok(None);
        }

        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok(Some((header[0], body)))
    }

    fn read_connect(body: &[u8], session: &mut Session) {
        let mut at = 0;
        let _protocol = read_str(body, &mut at);
        let _level = body[at];
        let flags = body[at + 1];
        at += 4;
        session.client_id = read_str(body, &mut at);
        if flags & 0x80 != 0 {
            session.username = read_str(body, &mut at);
        }
        if flags & 0x40 != 0 {
            session.password = read_str(body, &mut at);
        }
    }

    fn read_str(buf: &[u8], at: &mut usize) -> String {
        let len = u16::from_be_bytes([buf[*at], buf[*at + 1]]) as usize;
        let value = String::from_utf8_lossy(&buf[*at + 2..*at + 2 + len]).into_owned();
        *at += 2 + len;
        value
    }
}
