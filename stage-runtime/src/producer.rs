//! The shared producer task: delivery futures are pushed onto a channel
//! and awaited off the hot path, so a slow broker never stalls the
//! consumer loop. On shutdown the channel is closed and drained.
use mcmot_common::metrics::{
    failures::{self, FailureKind},
    names::{FAILURES, MESSAGES_PROCESSED},
};
use metrics::counter;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use tokio::{
    select,
    signal::unix::{Signal, SignalKind, signal},
    sync::mpsc::{Receiver, Sender, error::TrySendError},
    task::JoinHandle,
};
use tracing::{error, info, trace};

pub type DeliveryFutureSender = Sender<DeliveryFuture>;

/// Queues one record on the producer and hands its delivery future to the
/// producer task.
pub fn send_record(
    producer: &FutureProducer,
    sender: &DeliveryFutureSender,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<(), TrySendError<DeliveryFuture>> {
    let record = FutureRecord::to(topic).key(key).payload(payload);
    match producer.send_result(record) {
        Ok(future) => sender.try_send(future).inspect_err(|e| match e {
            TrySendError::Closed(_) => error!("delivery future channel closed"),
            TrySendError::Full(_) => error!("delivery future buffer full"),
        }),
        Err((e, _)) => {
            error!("failed to queue record: {e}");
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::KafkaPublishFailed)]
            )
            .increment(1);
            Ok(())
        }
    }
}

/// Creates the producer task and returns the channel feeding it.
pub fn create_producer_task(
    buffer_size: usize,
) -> std::io::Result<(DeliveryFutureSender, JoinHandle<()>)> {
    let (channel_send, channel_recv) = tokio::sync::mpsc::channel::<DeliveryFuture>(buffer_size);

    let sigint = signal(SignalKind::interrupt())?;
    let handle = tokio::spawn(produce_to_kafka(channel_recv, sigint));
    Ok((channel_send, handle))
}

async fn produce_to_kafka(mut channel_recv: Receiver<DeliveryFuture>, mut sigint: Signal) {
    loop {
        select! {
            message = channel_recv.recv() => {
                match message {
                    Some(future) => {
                        await_delivery(future).await
                    },
                    None => {
                        info!("delivery future channel closed");
                        return;
                    }
                }
            },
            _ = sigint.recv() => {
                close_and_flush_producer_channel(&mut channel_recv).await;
            }
        }
    }
}

async fn await_delivery(future: DeliveryFuture) {
    match future.await {
        Ok(Ok(_)) => {
            trace!("published message");
            counter!(MESSAGES_PROCESSED).increment(1);
        }
        Ok(Err((e, _))) => {
            error!("delivery failed: {e}");
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::KafkaPublishFailed)]
            )
            .increment(1);
        }
        Err(e) => {
            error!("producer dropped delivery future: {e}");
            counter!(
                FAILURES,
                &[failures::get_label(FailureKind::KafkaPublishFailed)]
            )
            .increment(1);
        }
    }
}

#[tracing::instrument(skip_all, name = "Closing", level = "info", fields(capacity = channel_recv.capacity(), max_capacity = channel_recv.max_capacity()))]
async fn close_and_flush_producer_channel(channel_recv: &mut Receiver<DeliveryFuture>) -> Option<()> {
    channel_recv.close();

    loop {
        let future = channel_recv.recv().await?;
        await_delivery(future).await;
    }
}
