pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;
pub mod upstream;

use std::{sync::Arc, time::Duration};

use service::ServiceOptions;
use tokio::net::TcpListener;

use self::{
    config::Config, observer::Observer, statistics::Statistics, upstream::JetstreamConnector,
};

pub type Service = service::Service<JetstreamConnector, Observer>;

/// Build the relay service from the configuration. Nothing is connected
/// until the first subscriber arrives.
pub fn create_service(config: &Config, statistics: Statistics) -> anyhow::Result<Service> {
    Ok(Service::new(ServiceOptions {
        connector: JetstreamConnector::new(config.upstream.url()?),
        handler: Observer::new(statistics),
        reconnect_delay: config.upstream.get_reconnect_delay(),
    }))
}

/// In order to let the integration test directly use the emoji-relay crate
/// and start the server, a function is opened to replace the main function
/// to directly start the server.
///
/// Runs until ctrl-c, then drops every subscriber and closes the upstream.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();
    let service = create_service(&config, statistics.clone())?;

    let listener = TcpListener::bind(config.server.listen).await?;
    log::info!("websocket server listening: addr={}", config.server.listen);

    let reporter = (config.log.stats_interval > 0).then(|| {
        tokio::spawn(report(
            statistics,
            service.clone(),
            Duration::from_secs(config.log.stats_interval),
        ))
    });

    let result = tokio::select! {
        result = server::run(config.clone(), listener, service.clone()) => result,
        result = tokio::signal::ctrl_c() => {
            log::info!("shutting down");

            result.map_err(Into::into)
        }
    };

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    service.shutdown();
    result
}

async fn report(statistics: Statistics, service: Service, period: Duration) {
    let mut interval = tokio::time::interval(period);

    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;

        let stats = statistics.snapshot();
        log::info!(
            "statistics: subscribers={}, upstream={:?}, frames={}, invalid={}, dispatched={}, summaries={}, posts={}, dropped={}, connects={}",
            service.registry().len(),
            service.upstream_state(),
            stats.frames,
            stats.invalid_frames,
            stats.dispatched,
            stats.summaries,
            stats.posts,
            stats.dropped,
            stats.connects,
        );
    }
}
