use std::{future::Future, pin::Pin, time::Duration};

use tokio::time::{Instant, interval_at};

use super::Client;
use crate::protocol::{
    heartbeat::{self, TickOutcome},
    transport::FrameReader,
};

/// Drains frames from `reader` until the socket fails, then reports the loss for `epoch`.
pub(crate) fn read_loop(client: Client, mut reader: FrameReader, epoch: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        loop {
            match reader.next_frame().await {
                Ok(frame) => client.on_frame(frame).await,
                Err(error) => {
                    tracing::warn!(epoch, error = %error, "connection closed");
                    break;
                }
            }
        }
        client.on_lost(epoch).await;
    })
}

/// Runs heartbeat ticks every `interval` until one closes the connection.
///
/// Each tick runs on its own task so aborting this loop never interrupts a
/// re-register that the tick itself started.
pub(crate) async fn heartbeat_loop(client: Client, interval: Duration) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let link = client.clone();
        let outcome = tokio::spawn(async move { heartbeat::tick(&link).await }).await;
        match outcome {
            Ok(TickOutcome::Alive) => {}
            Ok(TickOutcome::Closed) => break,
            Err(error) => {
                tracing::error!(error = %error, "heartbeat task failed");
                break;
            }
        }
    }
}
