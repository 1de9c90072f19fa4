use anyhow::Result;
use futures_util::StreamExt;
use service::upstream::{Connection, Connector};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

/// Opens websocket connections to a Jetstream instance.
pub struct JetstreamConnector {
    url: Url,
}

impl JetstreamConnector {
    /// `url` is the full subscribe url, collection filter included.
    pub fn new(url: Url) -> Self {
        // rustls can not pick a provider by itself once more than one is
        // compiled in. An error means one is already installed.
        #[cfg(feature = "tls")]
        let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();

        Self { url }
    }
}

impl Connector for JetstreamConnector {
    type Connection = JetstreamConnection;

    async fn connect(&self) -> Result<Self::Connection> {
        log::info!("connecting to upstream: url={}", self.url);

        let (stream, _) = connect_async(self.url.as_str()).await?;
        Ok(JetstreamConnection(stream))
    }
}

pub struct JetstreamConnection(WebSocketStream<MaybeTlsStream<TcpStream>>);

impl Connection for JetstreamConnection {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(text.as_bytes().to_vec()),
                Ok(Message::Binary(bytes)) => return Some(bytes.to_vec()),
                Ok(Message::Close(frame)) => {
                    log::info!("upstream sent close: frame={:?}", frame);

                    return None;
                }
                // Ping is answered by the stream itself.
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("upstream read failed: err={}", e);

                    return None;
                }
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.0.close(None).await {
            log::debug!("upstream close failed: err={}", e);
        }
    }
}
