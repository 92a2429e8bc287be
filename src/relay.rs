use std::future::Future;

use anyhow::Context;

use crate::{
    airvisual::AirVisualClient,
    iot_hub::{ConnectionString, DeviceClient, DeviceOptions, Message},
    telemetry::TelemetryRecord,
};

pub trait TelemetrySink {
    fn publish(
        &self,
        record: &TelemetryRecord,
    ) -> impl Future<Output = Result<(), anyhow::Error>> + Send;
}

/// Publishes each record over a fresh IoT Hub connection that is closed
/// right after the send.
#[derive(Debug)]
pub struct IotHubSink {
    connection_string: ConnectionString,
    options: DeviceOptions,
}

impl IotHubSink {
    pub fn new(connection_string: ConnectionString, options: DeviceOptions) -> Self {
        Self {
            connection_string,
            options,
        }
    }
}

impl TelemetrySink for IotHubSink {
    async fn publish(&self, record: &TelemetryRecord) -> Result<(), anyhow::Error> {
        // Repeated readings of an unrefreshed station share an id.
        let message = Message::json(record)?.with_message_id(record.timestamp.clone());

        let mut client = DeviceClient::connect(&self.connection_string, &self.options).await?;
        log::info!("Sending telemetry data to Azure IoT Hub...");
        let result = client.send_message(&message).await;
        client.shutdown().await;

        result
    }
}

pub struct TelemetryRelayJob<S> {
    upstream: AirVisualClient,
    sink: S,
}

impl<S: TelemetrySink> TelemetryRelayJob<S> {
    pub fn new(upstream: AirVisualClient, sink: S) -> Self {
        Self { upstream, sink }
    }

    pub async fn run(&self) {
        log::info!("Telemetry relay triggered");

        match self.relay().await {
            Ok(record) => log::info!(
                "Telemetry data successfully sent to IoT Hub: {} aqi_us={}",
                record.city,
                record.aqi_us
            ),
            Err(e) => log::error!("An error occurred: {e:#}"),
        }
    }

    pub async fn relay(&self) -> Result<TelemetryRecord, anyhow::Error> {
        let response = self.upstream.nearest_city().await?;
        let record = TelemetryRecord::from(&response);

        self.sink
            .publish(&record)
            .await
            .context("Failed to publish telemetry")?;

        Ok(record)
    }
}
