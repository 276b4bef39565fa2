use crate::{
    error::{CallbackError, StageError},
    producer::{DeliveryFutureSender, create_producer_task, send_record},
};
use mcmot_common::{
    CommonKafkaOpts, create_default_consumer, generate_kafka_client_config,
    metrics::{
        failures::{self, FailureKind},
        names::{FAILURES, FRAMES_SENT, FRAMES_SKIPPED, MESSAGES_RECEIVED},
        messages_received::{self, MessageKind},
        skips::{self, SkipKind},
    },
};
use mcmot_frame_sync::{FrameSync, SkipReason, SyncConfig, SyncDecision};
use mcmot_messages::{FrameEnvelope, Stage, dlq_topic, group_id, stage_topic};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use rdkafka::{
    Offset,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{BorrowedMessage, Header, Message, OwnedHeaders},
    producer::FutureProducer,
    util::Timeout,
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{debug, info, instrument, warn};

/// Messages are dead-lettered after this many failed deliveries.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Size of the delivery future buffer shared with the producer task.
const SEND_BUFFER_SIZE: usize = 1024;

/// One record to be produced on behalf of a stage callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRecord {
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    /// An envelope keyed by its camera id, the default for every
    /// per-camera topic.
    pub fn envelope(envelope: &FrameEnvelope) -> Result<Self, CallbackError> {
        Ok(Self {
            key: envelope.camera_id.clone(),
            payload: envelope.to_payload()?,
        })
    }
}

/// The capability a stage binary plugs into the runtime.
#[allow(async_fn_in_trait)]
pub trait StageHandler {
    /// The stage callback: zero or more outbound records per envelope.
    async fn on_envelope(
        &mut self,
        envelope: FrameEnvelope,
    ) -> Result<Vec<OutboundRecord>, CallbackError>;

    /// Called for frames the sync engine skipped, before they are
    /// committed and dropped.
    async fn on_skip(
        &mut self,
        envelope: FrameEnvelope,
        reason: SkipReason,
    ) -> Result<Vec<OutboundRecord>, CallbackError> {
        let _ = (envelope, reason);
        Ok(Vec::new())
    }

    /// Periodic tick on the runtime's poll interval, for time-driven work
    /// such as cache expiry or batch flushing.
    async fn on_poll(&mut self) -> Result<Vec<OutboundRecord>, CallbackError> {
        Ok(Vec::new())
    }
}

/// The generic consume → sync → callback → produce → commit loop.
pub struct StageRuntime {
    stage: Stage,
    consumer: StreamConsumer,
    producer: FutureProducer,
    output_topic: Option<String>,
    dlq_topic: String,
    sync: Option<FrameSync<()>>,
    poll_interval: Duration,
}

impl StageRuntime {
    /// Wires consumer and producer for `stage` of `pipeline`, subscribing
    /// to the upstream stage's topic. Stages without an upstream (capture)
    /// drive their own loop and do not use this runtime.
    pub fn new(
        kafka_opts: &CommonKafkaOpts,
        pipeline: &str,
        stage: Stage,
        sync_config: Option<SyncConfig>,
        poll_interval: Duration,
    ) -> Result<Self, StageError> {
        let upstream = stage
            .upstream()
            .ok_or_else(|| StageError::Config(format!("stage {stage} has no inbound topic")))?;
        let input_topic = stage_topic(upstream, pipeline);

        let consumer = create_default_consumer(
            &kafka_opts.broker,
            &kafka_opts.username,
            &kafka_opts.password,
            &group_id(pipeline, stage, "main"),
            Some(&[input_topic.as_str()]),
        )?;

        let producer: FutureProducer = generate_kafka_client_config(
            &kafka_opts.broker,
            &kafka_opts.username,
            &kafka_opts.password,
        )
        .set("message.max.bytes", "10485760")
        .create()
        .map_err(StageError::Broker)?;

        let output_topic = match stage {
            Stage::Analytics => None,
            _ => Some(stage_topic(stage, pipeline)),
        };

        Ok(Self {
            stage,
            consumer,
            producer,
            output_topic,
            dlq_topic: dlq_topic(stage, pipeline),
            sync: sync_config.map(FrameSync::new),
            poll_interval,
        })
    }

    pub fn producer(&self) -> &FutureProducer {
        &self.producer
    }

    /// Runs until SIGINT, SIGTERM or a fatal callback error. The producer
    /// channel is drained before returning.
    pub async fn run<H: StageHandler>(self, handler: &mut H) -> Result<(), StageError> {
        let (sender, producer_task_handle) = create_producer_task(SEND_BUFFER_SIZE)?;

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut poll_interval = tokio::time::interval(self.poll_interval);

        // Failed delivery counts by `(partition, offset)`.
        let mut attempts: HashMap<(i32, i64), u32> = HashMap::new();

        let result = loop {
            select! {
                message = self.consumer.recv() => {
                    match message {
                        Ok(m) => {
                            if let Err(e) = self.process_message(handler, &sender, &mut attempts, &m).await {
                                break Err(e);
                            }
                        }
                        Err(e) => warn!("Kafka error: {e}"),
                    }
                }
                _ = poll_interval.tick() => {
                    match handler.on_poll().await {
                        Ok(records) => self.dispatch(&sender, records),
                        Err(CallbackError::Fatal(e)) => break Err(e),
                        Err(e) => warn!("poll callback failed: {e}"),
                    }
                }
                _ = sigint.recv() => {
                    info!("interrupt received, shutting down");
                    break Ok(());
                }
                _ = sigterm.recv() => {
                    info!("termination requested, shutting down");
                    break Ok(());
                }
            }
        };

        // Close the delivery channel and wait for in-flight productions.
        drop(sender);
        if let Err(e) = producer_task_handle.await {
            warn!("producer task join failed: {e}");
        }
        result
    }

    #[instrument(skip_all, level = "debug", fields(stage = %self.stage, partition = m.partition(), offset = m.offset()))]
    async fn process_message<H: StageHandler>(
        &self,
        handler: &mut H,
        sender: &DeliveryFutureSender,
        attempts: &mut HashMap<(i32, i64), u32>,
        m: &BorrowedMessage<'_>,
    ) -> Result<(), StageError> {
        let Some(payload) = m.payload() else {
            self.commit(m);
            return Ok(());
        };

        let envelope = match FrameEnvelope::from_payload(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to parse message: {e}");
                counter!(
                    FAILURES,
                    &[failures::get_label(FailureKind::UnableToDecodeMessage)]
                )
                .increment(1);
                counter!(
                    MESSAGES_RECEIVED,
                    &[messages_received::get_label(MessageKind::Unexpected)]
                )
                .increment(1);
                self.dead_letter(sender, m, &e.to_string());
                self.commit(m);
                return Ok(());
            }
        };

        counter!(
            MESSAGES_RECEIVED,
            &[
                messages_received::get_label(MessageKind::Frame),
                ("camera_id", envelope.camera_id.clone())
            ]
        )
        .increment(1);

        if let Some(sync) = &self.sync {
            match sync.skip_or_wait(
                &envelope.camera_id,
                envelope.frame_number,
                envelope.frame_timestamp,
                envelope.fps,
            ) {
                SyncDecision::Accept => {}
                SyncDecision::Skip(reason) => {
                    debug!(
                        camera_id = %envelope.camera_id,
                        frame_number = envelope.frame_number,
                        ?reason,
                        "skipping frame"
                    );
                    let kind = match reason {
                        SkipReason::Duplicate => SkipKind::Duplicate,
                        SkipReason::Stale => SkipKind::Stale,
                    };
                    counter!(FRAMES_SKIPPED, &[skips::get_label(kind)]).increment(1);
                    match handler.on_skip(envelope, reason).await {
                        Ok(records) => self.dispatch(sender, records),
                        Err(CallbackError::Fatal(e)) => return Err(e),
                        Err(e) => warn!("skip callback failed: {e}"),
                    }
                    self.commit(m);
                    return Ok(());
                }
                SyncDecision::Wait(duration) => {
                    // Honour the wait by blocking, bounded by the
                    // configured latency threshold.
                    let cap =
                        Duration::from_secs_f64(sync.config().latency_threshold.max(0.0));
                    tokio::time::sleep(duration.min(cap)).await;
                }
            }
        }

        match handler.on_envelope(envelope).await {
            Ok(records) => {
                self.dispatch(sender, records);
                attempts.remove(&(m.partition(), m.offset()));
                self.commit(m);
                Ok(())
            }
            Err(CallbackError::Fatal(e)) => Err(e),
            Err(e) => {
                let attempt_count = attempts
                    .entry((m.partition(), m.offset()))
                    .and_modify(|count| *count += 1)
                    .or_insert(1);
                warn!(attempts = *attempt_count, "callback failed: {e}");

                if *attempt_count >= MAX_DELIVERY_ATTEMPTS {
                    self.dead_letter(sender, m, &e.to_string());
                    attempts.remove(&(m.partition(), m.offset()));
                    self.commit(m);
                } else if let Err(seek_error) = self.consumer.seek(
                    m.topic(),
                    m.partition(),
                    Offset::Offset(m.offset()),
                    Timeout::After(Duration::from_secs(1)),
                ) {
                    // Without the seek the message would not come back
                    // until a rebalance; log and move on.
                    warn!("failed to rewind for redelivery: {seek_error}");
                }
                Ok(())
            }
        }
    }

    fn dispatch(&self, sender: &DeliveryFutureSender, records: Vec<OutboundRecord>) {
        let Some(topic) = &self.output_topic else {
            if !records.is_empty() {
                warn!(stage = %self.stage, "dropping outbound records: stage has no output topic");
            }
            return;
        };
        for record in records {
            if send_record(&self.producer, sender, topic, &record.key, &record.payload).is_ok() {
                counter!(FRAMES_SENT).increment(1);
            }
        }
    }

    /// Moves a poisoned message to the stage's dead-letter topic, carrying
    /// the final error in a header.
    fn dead_letter(&self, sender: &DeliveryFutureSender, m: &BorrowedMessage<'_>, error: &str) {
        warn!(topic = %self.dlq_topic, "dead-lettering message");
        counter!(FAILURES, &[failures::get_label(FailureKind::DeadLettered)]).increment(1);

        let key = m
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default();
        let payload = m.payload().unwrap_or_default();
        let headers = OwnedHeaders::new().insert(Header {
            key: "mcmot-dlq-error",
            value: Some(error),
        });

        let record = rdkafka::producer::FutureRecord::to(&self.dlq_topic)
            .key(&key)
            .payload(payload)
            .headers(headers);
        match self.producer.send_result(record) {
            Ok(future) => {
                if sender.try_send(future).is_err() {
                    warn!("delivery future channel rejected dead-letter record");
                }
            }
            Err((e, _)) => warn!("failed to queue dead-letter record: {e}"),
        }
    }

    fn commit(&self, m: &BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(m, CommitMode::Async) {
            warn!("failed to commit message: {e}");
        }
    }
}

/// Installs the Prometheus exporter and registers the counters common to
/// every stage.
pub fn install_observability(address: SocketAddr) -> Result<(), StageError> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| StageError::Config(format!("observability setup failed: {e}")))?;

    metrics::describe_counter!(
        MESSAGES_RECEIVED,
        metrics::Unit::Count,
        "Number of messages received"
    );
    metrics::describe_counter!(
        mcmot_common::metrics::names::MESSAGES_PROCESSED,
        metrics::Unit::Count,
        "Number of messages processed"
    );
    metrics::describe_counter!(
        FAILURES,
        metrics::Unit::Count,
        "Number of failures encountered"
    );
    metrics::describe_counter!(
        FRAMES_SENT,
        metrics::Unit::Count,
        "Number of frames produced downstream"
    );
    metrics::describe_counter!(
        FRAMES_SKIPPED,
        metrics::Unit::Count,
        "Number of frames dropped by the sync engine"
    );
    Ok(())
}
