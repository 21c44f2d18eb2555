use std::time::Duration;

use alloy_provider::{ConnectionConfig, DynProvider, Provider, ProviderBuilder};
use alloy_transport::{TransportError, TransportErrorKind};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a provider for `url`. HTTP endpoints get a plain reqwest client so a
/// failing request surfaces immediately; pubsub endpoints only reconnect.
pub async fn build_provider(
    url: &Url,
    connect_timeout: Duration,
) -> Result<DynProvider, TransportError> {
    match url.scheme() {
        "http" | "https" => {
            let client = reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(TransportErrorKind::custom)?;
            Ok(ProviderBuilder::new()
                .connect_reqwest(client, url.clone())
                .erased())
        }
        _ => {
            let config = ConnectionConfig::new()
                .with_max_retries(5)
                .with_retry_interval(Duration::from_secs(2));
            ProviderBuilder::new()
                .connect_with_config(url.as_str(), config)
                .await
                .map(Provider::erased)
        }
    }
}
