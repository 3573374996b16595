//! uamon demo: a simulated plant sampled by an in-process server and
//! mirrored by a client subscription.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use uamon::client::{ClientMonitoredItem, ClientSubscription};
use uamon::config::EngineConfig;
use uamon::sampling::{Sample, SampleSink, SampleSource, SampledItem, SampledValue};
use uamon::server::LocalServer;
use uamon::store::{AttributeStore, MemoryStore, SqliteStore};
use uamon::types::{DataChangeFilter, DataValue, MonitoringFilter, MonitoringParameters, NodeId, Range, ReadValueId};

/// Random walk over every numeric node it is asked to sample.
struct SimulatedPlant {
    levels: Mutex<HashMap<NodeId, f64>>,
}

impl SampleSource for SimulatedPlant {
    fn sample(&self, items: &[Arc<SampledItem>], sink: &dyn SampleSink) {
        let mut rng = rand::thread_rng();
        let mut levels = self.levels.lock();
        let mut seen = HashSet::new();
        let mut sample = Sample::now();

        for sampled in items {
            let target = sampled.item().target();
            if !target.attribute_id.is_value() || !seen.insert(target.node_id.clone()) {
                continue;
            }
            if let Some(level) = levels.get_mut(&target.node_id) {
                *level += rng.gen_range(-1.0..1.0);
                sample.push(SampledValue::new(target.clone(), *level));
            }
        }

        if !sample.is_empty() {
            sink.post(sample);
        }
    }
}

fn plant_nodes() -> Vec<(NodeId, f64, Option<Range>)> {
    vec![
        (NodeId::string(2, "Plant.Boiler.Temperature"), 85.0, Some(Range::new(0.0, 200.0))),
        (NodeId::string(2, "Plant.Boiler.Pressure"), 4.2, Some(Range::new(0.0, 10.0))),
        (NodeId::string(2, "Plant.Tank.Level"), 50.0, None),
    ]
}

fn open_store(cfg: &EngineConfig) -> Result<Arc<dyn AttributeStore>, Box<dyn std::error::Error + Send + Sync>> {
    match &cfg.db_path {
        Some(path) => {
            tracing::info!("Using database at {}", path);
            let store = SqliteStore::new(path)?;
            for (node, value, range) in plant_nodes() {
                store.add_node(&node, &DataValue::new(value))?;
                store.set_eu_range(&node, range)?;
            }
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Using in-memory node store");
            let store = MemoryStore::new();
            for (node, value, range) in plant_nodes() {
                store.add_node(node.clone(), DataValue::new(value));
                store.set_eu_range(&node, range)?;
            }
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("uamon=info".parse()?))
        .init();

    let cfg = EngineConfig::load();
    tracing::info!("Starting uamon demo for {:?}", cfg.run_time);

    let store = open_store(&cfg)?;
    let server = Arc::new(LocalServer::new(store, cfg.sampling.clone()));
    server.add_source(Arc::new(SimulatedPlant {
        levels: Mutex::new(plant_nodes().into_iter().map(|(n, v, _)| (n, v)).collect()),
    }));
    server.start();

    let subscription = ClientSubscription::new(server.clone(), cfg.client.clone(), tokio::runtime::Handle::current());
    subscription.set_publishing_interval(500.0);
    subscription.create().await?;

    let filters = [
        Some(MonitoringFilter::DataChange(DataChangeFilter::percent(1.0))),
        Some(MonitoringFilter::DataChange(DataChangeFilter::absolute(0.5))),
        None,
    ];
    for ((node, _, _), filter) in plant_nodes().into_iter().zip(filters) {
        let item = subscription.add_item(
            ReadValueId::value_of(node),
            MonitoringParameters {
                sampling_interval: 100.0,
                queue_size: 10,
                filter,
                ..Default::default()
            },
        );
        item.add_value_listener(Arc::new(|item: &ClientMonitoredItem, value: &DataValue| {
            tracing::info!("{} = {:?} ({})", item.target().node_id, value.value, value.status);
        }));
    }

    if let Err(e) = subscription.synchronize_monitored_items().await {
        tracing::warn!("Synchronization incomplete: {}", e);
    }

    let Some(subscription_id) = subscription.subscription_id() else {
        return Err("subscription was not created".into());
    };
    let publishing_interval = subscription
        .revised()
        .map_or(500.0, |r| r.publishing_interval);

    let started = Instant::now();
    let mut sequence_number = 0u32;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(publishing_interval / 1000.0));

    while started.elapsed() < cfg.run_time {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                let notifications = server.collect_notifications(subscription_id).unwrap_or_default();
                if !notifications.is_empty() {
                    sequence_number = sequence_number.wrapping_add(1);
                    subscription.on_data_change(sequence_number, &notifications);
                }
            }
        }
    }

    for (handle, value) in subscription.values() {
        match value {
            Some(v) => tracing::info!("Final value of item {}: {:?} ({})", handle, v.value, v.status),
            None => tracing::info!("Final value of item {}: none received", handle),
        }
    }

    if let Some(diag) = server.diagnostics(subscription_id) {
        tracing::info!("Diagnostics: {}", serde_json::to_string(&diag)?);
    }

    subscription.delete().await?;
    server.shutdown();
    tracing::info!("Stopped");

    Ok(())
}
