use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::channel,
};

use tokio_tungstenite::{
    accept_async_with_config,
    tungstenite::{Message, protocol::WebSocketConfig},
};

use crate::{Service, config::Config};

/// Accept subscriber connections until the listener fails.
///
/// Every connection runs in its own task, a connection that fails to upgrade
/// only ends itself.
pub async fn run(config: Arc<Config>, listener: TcpListener, service: Service) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(it) => it,
            Err(e) => {
                log::warn!("websocket server accept failed: err={}", e);

                continue;
            }
        };

        let config = config.clone();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(&config, stream, addr, &service).await {
                log::warn!("websocket connection failed: addr={}, err={}", addr, e);
            }
        });
    }
}

async fn handle(config: &Config, stream: TcpStream, addr: SocketAddr, service: &Service) -> Result<()> {
    let mut options = WebSocketConfig::default();
    options.max_message_size = Some(config.server.max_payload_size);
    options.max_frame_size = Some(config.server.max_payload_size);

    let socket = accept_async_with_config(stream, Some(options)).await?;
    let (mut writer, mut reader) = socket.split();

    let (sender, mut receiver) = channel(config.server.send_queue_size);
    let id = service.register(sender);

    log::info!("websocket accepted: addr={}, id={}", addr, id);

    // The queue ends when the subscriber is dropped from the registry, the
    // connection is then closed.
    let write = async {
        while let Some(payload) = receiver.recv().await {
            if let Err(e) = writer.send(Message::Text(payload)).await {
                log::debug!("websocket write failed: id={}, err={}", id, e);

                return;
            }
        }

        let _ = writer.close().await;
    };

    let read = async {
        while let Some(message) = reader.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let _ = service.on_message(id, text.as_bytes());
                }
                Ok(Message::Binary(bytes)) => {
                    let _ = service.on_message(id, &bytes);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => (),
                Err(e) => {
                    log::debug!("websocket read failed: id={}, err={}", id, e);

                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = write => (),
        _ = read => (),
    }

    service.unregister(id);
    log::info!("websocket closed: addr={}, id={}", addr, id);

    Ok(())
}
