//! Runs a small fleet of processors in one process against the in-memory stream and store, with
//! a producer appending keyed records. Useful to watch partitions move between instances and
//! checkpoints advance. Stops on ctrl-c, or after `EVENTFLOW_DEMO_RUN_FOR_SECS`.

use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use eventflow_core::metrics::MetricsObserver;
use eventflow_core::{EventHandler, EventProcessor, HandlerError, Observer, ProcessorConfig};
use eventflow_shared::stream::ConsumerRecord;
use eventflow_testing::simplekvstore::SimpleKVStore;
use eventflow_testing::simplestream::SimpleStream;

mod setup_tracing;

const ENV_STREAM_ID: &str = "EVENTFLOW_STREAM_ID";
const ENV_PARTITIONS: &str = "EVENTFLOW_DEMO_PARTITIONS";
const ENV_INSTANCES: &str = "EVENTFLOW_DEMO_INSTANCES";
const ENV_PRODUCE_INTERVAL_MS: &str = "EVENTFLOW_DEMO_PRODUCE_INTERVAL_MS";
const ENV_RUN_FOR_SECS: &str = "EVENTFLOW_DEMO_RUN_FOR_SECS";

#[derive(Clone)]
struct LoggingHandler;

impl EventHandler for LoggingHandler {
    async fn process(&self, batch: &[ConsumerRecord]) -> Result<(), HandlerError> {
        for record in batch {
            info!(
                partition = %record.partition,
                sequence_number = record.sequence_number,
                key = ?record.partition_key,
                payload = %String::from_utf8_lossy(&record.payload),
                "Processed record"
            );
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(value) => value
            .parse()
            .map_err(|e| format!("Invalid value {value} for {key}: {e}").into()),
        None => Ok(default),
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let mut vars: HashMap<String, String> = env::vars().collect();
    vars.entry(ENV_STREAM_ID.to_string())
        .or_insert_with(|| "orders".to_string());

    let config = ProcessorConfig::load(vars.clone())?;
    let partitions: usize = parse_or(&vars, ENV_PARTITIONS, 4)?;
    let instances: usize = parse_or(&vars, ENV_INSTANCES, 2)?;
    let produce_interval = Duration::from_millis(parse_or(&vars, ENV_PRODUCE_INTERVAL_MS, 200)?);
    let run_for = match vars.get(ENV_RUN_FOR_SECS) {
        Some(_) => Some(Duration::from_secs(parse_or(&vars, ENV_RUN_FOR_SECS, 0)?)),
        None => None,
    };

    let stream = SimpleStream::new(config.stream_id.clone(), partitions);
    let store = SimpleKVStore::new("eventflow");
    let metrics = Arc::new(MetricsObserver::new(
        config.stream_id.clone(),
        config.consumer_group.clone(),
    ));

    let mut processors = Vec::with_capacity(instances);
    for i in 0..instances {
        let instance_config = config
            .clone()
            .with_instance_id(format!("{}-{i}", config.instance_id));
        let processor = EventProcessor::builder(
            instance_config,
            Arc::new(stream.clone()),
            Arc::new(store.clone()),
            LoggingHandler,
        )
        .observer(Arc::clone(&metrics) as Arc<dyn Observer>)
        .build()?;
        processor.start().await?;
        processors.push(processor);
    }
    info!(partitions, instances, "Demo fleet started");

    let cancel = CancellationToken::new();
    let producer = tokio::spawn(produce(stream.clone(), cancel.clone(), produce_interval));

    match run_for {
        Some(duration) => {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => signal?,
                _ = tokio::time::sleep(duration) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutting down");
    cancel.cancel();
    producer.await?;
    for processor in &processors {
        processor.stop().await?;
    }
    info!(metrics = %metrics.encode()?, "Final metrics");

    Ok(())
}

async fn produce(stream: SimpleStream, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut produced: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let key = format!("customer-{}", produced % 16);
        let properties = HashMap::from([("producer".to_string(), "demo".to_string())]);
        if let Err(e) = stream.append_keyed(&key, Bytes::from(format!("order-{produced}")), properties)
        {
            error!(error = %e, "Failed to append record");
        }
        produced += 1;
    }
    info!(produced, "Producer stopped");
}
