//! Sink collaborators: anything that durably records a closed window's
//! tallies. The concrete sink runs behind a small actor so the emission path
//! never blocks a shard loop on I/O directly.

use tokio::sync::{mpsc, oneshot};

use crate::config::KafkaSinkSettings;
use crate::error::{Error, Result};
use crate::message::WindowTally;

mod blackhole;
mod kafka;
mod log;

/// Set of items to be implemented to become a usertally sink.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Write the tallies to the sink. Failure covers the whole batch.
    async fn sink(&mut self, tallies: Vec<WindowTally>) -> Result<()>;
}

enum ActorMessage {
    Sink {
        tallies: Vec<WindowTally>,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

struct SinkActor<T> {
    actor_messages: mpsc::Receiver<ActorMessage>,
    sink: T,
}

impl<T> SinkActor<T>
where
    T: Sink,
{
    fn new(actor_messages: mpsc::Receiver<ActorMessage>, sink: T) -> Self {
        Self {
            actor_messages,
            sink,
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Sink {
                tallies,
                respond_to,
            } => {
                let response = self.sink.sink(tallies).await;
                let _ = respond_to.send(response);
            }
        }
    }
}

/// The concrete sink implementations supported out of the box.
pub enum SinkClientType {
    Log,
    Blackhole,
    Kafka(KafkaSinkSettings),
}

/// Cloneable handle to the sink actor. The actor task exits when every handle
/// is dropped and the channel drains.
#[derive(Clone)]
pub struct SinkHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl SinkHandle {
    pub async fn new(sink_client: SinkClientType, channel_capacity: usize) -> Result<Self> {
        match sink_client {
            SinkClientType::Log => Ok(Self::spawn(log::LogSink, channel_capacity)),
            SinkClientType::Blackhole => {
                Ok(Self::spawn(blackhole::BlackholeSink, channel_capacity))
            }
            SinkClientType::Kafka(settings) => {
                let sink = kafka::new_kafka_sink(&settings)?;
                Ok(Self::spawn(sink, channel_capacity))
            }
        }
    }

    fn spawn<T>(sink: T, channel_capacity: usize) -> Self
    where
        T: Sink + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(channel_capacity);
        tokio::spawn(async move {
            let mut actor = SinkActor::new(receiver, sink);
            while let Some(msg) = actor.actor_messages.recv().await {
                actor.handle_message(msg).await;
            }
        });
        Self { sender }
    }

    pub async fn sink(&self, tallies: Vec<WindowTally>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let msg = ActorMessage::Sink {
            tallies,
            respond_to: tx,
        };
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Sink("Sink actor is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Sink("Sink actor dropped the response".to_string()))?
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    /// Collects every tally it receives, for assertions.
    #[derive(Clone, Default)]
    pub(crate) struct CollectSink {
        pub(crate) collected: Arc<Mutex<Vec<WindowTally>>>,
    }

    impl Sink for CollectSink {
        async fn sink(&mut self, tallies: Vec<WindowTally>) -> Result<()> {
            self.collected.lock().await.extend(tallies);
            Ok(())
        }
    }

    /// Fails the first `failures` batches, then behaves like CollectSink.
    #[derive(Clone)]
    pub(crate) struct FlakySink {
        pub(crate) failures: Arc<AtomicUsize>,
        pub(crate) collected: Arc<Mutex<Vec<WindowTally>>>,
    }

    impl FlakySink {
        pub(crate) fn new(failures: usize) -> Self {
            Self {
                failures: Arc::new(AtomicUsize::new(failures)),
                collected: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Sink for FlakySink {
        async fn sink(&mut self, tallies: Vec<WindowTally>) -> Result<()> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                    remaining.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::Sink("transient failure".to_string()));
            }
            self.collected.lock().await.extend(tallies);
            Ok(())
        }
    }

    pub(crate) fn collecting_handle(capacity: usize) -> (SinkHandle, CollectSink) {
        let sink = CollectSink::default();
        (SinkHandle::spawn(sink.clone(), capacity), sink)
    }

    pub(crate) fn flaky_handle(failures: usize, capacity: usize) -> (SinkHandle, FlakySink) {
        let sink = FlakySink::new(failures);
        (SinkHandle::spawn(sink.clone(), capacity), sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(bucket_key: i64, user_id: &str, count: u64) -> WindowTally {
        WindowTally {
            bucket_key,
            user_id: user_id.to_string(),
            count,
        }
    }

    #[tokio::test]
    async fn handle_roundtrip() {
        let (handle, sink) = test_utils::collecting_handle(4);
        handle
            .sink(vec![tally(60, "a", 2), tally(60, "b", 1)])
            .await
            .unwrap();

        let collected = sink.collected.lock().await;
        assert_eq!(*collected, vec![tally(60, "a", 2), tally(60, "b", 1)]);
    }

    #[tokio::test]
    async fn flaky_sink_fails_then_recovers() {
        let (handle, _sink) = test_utils::flaky_handle(2, 4);
        assert!(handle.sink(vec![tally(60, "a", 1)]).await.is_err());
        assert!(handle.sink(vec![tally(60, "a", 1)]).await.is_err());
        assert!(handle.sink(vec![tally(60, "a", 1)]).await.is_ok());
    }
}
