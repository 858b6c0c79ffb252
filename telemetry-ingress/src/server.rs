use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use health::HealthRegistry;
use telemetry_common::metrics::setup_metrics_recorder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::adapter::Ingestor;
use crate::auth::{AllowAll, DeviceAuthenticator, HttpDeviceAuthenticator};
use crate::config::Config;
use crate::limiter::RateLimiter;
use crate::mqtt::MqttSubscriber;
use crate::router;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::sinks::TelemetrySink;
use crate::time::SystemTime;

async fn create_sink(
    config: &Config,
    liveness: &HealthRegistry,
) -> anyhow::Result<Arc<dyn TelemetrySink + Send + Sync>> {
    if config.print_sink {
        // Print sink is only used for local debug, don't allow a container with it to run on prod
        let handle = liveness
            .register("print_sink".to_string(), Duration::from_secs(30))
            .await;
        Ok(Arc::new(PrintSink::new(handle).await))
    } else {
        let sink_liveness = liveness
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;
        Ok(Arc::new(KafkaSink::new(&config.kafka, sink_liveness)?))
    }
}

fn create_authenticator(config: &Config) -> anyhow::Result<Arc<dyn DeviceAuthenticator>> {
    if config.device_auth.device_auth_enabled {
        Ok(Arc::new(HttpDeviceAuthenticator::from_config(
            &config.device_auth,
        )?))
    } else {
        Ok(Arc::new(AllowAll {}))
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");
    let token = CancellationToken::new();

    let sink = create_sink(&config, &liveness)
        .await
        .expect("failed to create sink");
    let authenticator = create_authenticator(&config).expect("failed to create authenticator");

    let limiter = RateLimiter::from_config(&config.rate_limit);
    {
        // Ensure that the rate limiter state does not grow unbounded
        let limiter = limiter.clone();
        let token = token.clone();
        tokio::spawn(async move { limiter.clean_state(token).await });
    }
    if config.export_prometheus {
        let limiter = limiter.clone();
        let token = token.clone();
        tokio::spawn(async move { limiter.report_metrics(token).await });
    }

    let ingestor = Ingestor::new(sink, limiter, authenticator);

    let mqtt = if config.mqtt.mqtt_enabled {
        let mqtt_liveness = liveness
            .register("mqtt".to_string(), Duration::from_secs(60))
            .await;
        let subscriber = MqttSubscriber::new(
            config.mqtt.clone(),
            ingestor.clone(),
            Arc::new(SystemTime {}),
            mqtt_liveness,
        );
        Some(tokio::spawn(subscriber.run(token.clone())))
    } else {
        None
    };

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().expect("failed to install metrics recorder"))
    } else {
        None
    };

    let app = router::router(
        SystemTime {},
        liveness,
        ingestor,
        config.max_body_bytes,
        metrics,
    );

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on an unknown address: {}", e),
    }

    let stop = token.clone();
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        stop.cancel();
    })
    .await
    {
        tracing::error!("server error: {}", e);
    }

    // Stop the background tasks
    token.cancel();
    if let Some(mqtt) = mqtt {
        if let Err(e) = mqtt.await {
            tracing::error!("MQTT subscriber task failed: {}", e);
        }
    }
}
