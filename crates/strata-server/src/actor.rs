use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use log::{error, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

const ACTOR_CHANNEL_SIZE: usize = 8;

pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options;
    type Error: From<mpsc::error::SendError<Self::Message>> + fmt::Display;

    fn new(options: Self::Options) -> Self;
    fn start(&mut self, ctx: &mut ActorContext<Self>) -> Result<(), Self::Error>;
    fn receive(
        &mut self,
        ctx: &mut ActorContext<Self>,
        message: Self::Message,
    ) -> Result<ActorAction, Self::Error>;
    fn stop(self, ctx: &mut ActorContext<Self>) -> Result<(), Self::Error>;
}

pub enum ActorAction {
    Continue,
    /// Logs the message and keeps the actor running.
    Warn(String),
    /// Logs the message and stops the actor.
    Fail(String),
    Stop,
}

impl ActorAction {
    pub fn warn(message: impl ToString) -> Self {
        ActorAction::Warn(message.to_string())
    }

    pub fn fail(message: impl ToString) -> Self {
        ActorAction::Fail(message.to_string())
    }
}

/// The execution context of an actor.
///
/// Messages sent via [`ActorContext::send`] are processed before any message
/// waiting in the actor channel, in the order they are sent.
/// Background tasks spawned via the context are aborted when the actor stops,
/// so they never deliver messages to a stopped actor.
pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    queue: VecDeque<T::Message>,
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    fn new(handle: ActorHandle<T>) -> Self {
        Self {
            handle,
            queue: VecDeque::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    pub fn send(&mut self, message: T::Message) {
        self.queue.push_back(message);
    }

    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            // The send fails only when the actor is gone.
            let _ = handle.sender.send(message).await;
        });
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    /// Returns the number of background tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn next_local_message(&mut self) -> Option<T::Message> {
        self.queue.pop_front()
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!("actor background task panicked: {e}");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.queue.clear();
        self.tasks.shutdown().await;
    }
}

pub struct ActorHandle<T>
where
    T: Actor,
{
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T> Clone for ActorHandle<T>
where
    T: Actor,
{
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, mut rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let mut actor = T::new(options);
        let out = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let handle = out.clone();
        tokio::spawn(async move {
            let mut ctx = ActorContext::new(handle);
            let mut running = match actor.start(&mut ctx) {
                Ok(()) => true,
                Err(e) => {
                    error!("failed to start actor: {e}");
                    false
                }
            };
            while running {
                let message = match ctx.next_local_message() {
                    Some(x) => x,
                    None => match rx.recv().await {
                        Some(x) => x,
                        None => break,
                    },
                };
                match actor.receive(&mut ctx, message) {
                    Ok(ActorAction::Continue) => {}
                    Ok(ActorAction::Warn(message)) => {
                        warn!("{message}");
                    }
                    Ok(ActorAction::Fail(message)) => {
                        error!("{message}");
                        running = false;
                    }
                    Ok(ActorAction::Stop) => {
                        running = false;
                    }
                    Err(e) => {
                        error!("error processing actor message: {e}");
                        running = false;
                    }
                }
                ctx.reap();
            }
            if let Err(e) = actor.stop(&mut ctx) {
                error!("failed to stop actor: {e}");
            }
            ctx.shutdown().await;
            let _ = stopped_tx.send(true);
        });
        out
    }

    pub async fn send(&self, message: T::Message) -> Result<(), T::Error> {
        self.sender.send(message).await.map_err(T::Error::from)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been dropped in this case,
        // which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests use unwrap for brevity")]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    struct TestActor {
        log: Vec<String>,
        fired: Arc<AtomicBool>,
    }

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl<T> From<mpsc::error::SendError<T>> for TestError {
        fn from(_: mpsc::error::SendError<T>) -> Self {
            Self
        }
    }

    enum TestMessage {
        Echo {
            value: String,
            reply: oneshot::Sender<String>,
        },
        Record {
            value: String,
        },
        ChainTwice,
        Delayed {
            value: String,
            delay: Duration,
        },
        SpawnLate {
            delay: Duration,
        },
        Log {
            reply: oneshot::Sender<Vec<String>>,
        },
        Stop,
    }

    impl Actor for TestActor {
        type Message = TestMessage;
        type Options = Arc<AtomicBool>;
        type Error = TestError;

        fn new(fired: Self::Options) -> Self {
            Self { log: vec![], fired }
        }

        fn start(&mut self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
            Ok(())
        }

        fn receive(
            &mut self,
            ctx: &mut ActorContext<Self>,
            message: Self::Message,
        ) -> Result<ActorAction, Self::Error> {
            match message {
                TestMessage::Echo { value, reply } => {
                    let _ = reply.send(value.to_uppercase());
                }
                TestMessage::Record { value } => {
                    self.log.push(value);
                }
                TestMessage::ChainTwice => {
                    ctx.send(TestMessage::Record {
                        value: "first".to_string(),
                    });
                    ctx.send(TestMessage::Record {
                        value: "second".to_string(),
                    });
                }
                TestMessage::Delayed { value, delay } => {
                    ctx.send_with_delay(TestMessage::Record { value }, delay);
                }
                TestMessage::SpawnLate { delay } => {
                    let fired = Arc::clone(&self.fired);
                    ctx.spawn(async move {
                        tokio::time::sleep(delay).await;
                        fired.store(true, Ordering::SeqCst);
                    });
                }
                TestMessage::Log { reply } => {
                    let _ = reply.send(self.log.clone());
                }
                TestMessage::Stop => return Ok(ActorAction::Stop),
            }
            Ok(ActorAction::Continue)
        }

        fn stop(self, _: &mut ActorContext<Self>) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    async fn read_log(handle: &ActorHandle<TestActor>) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        handle.send(TestMessage::Log { reply: tx }).await.unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_actor_handle_send() {
        let handle = ActorHandle::<TestActor>::new(Arc::new(AtomicBool::new(false)));
        assert!(!handle.sender.is_closed());
        let (tx, rx) = oneshot::channel();
        let result = handle
            .send(TestMessage::Echo {
                value: "hello".to_string(),
                reply: tx,
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(rx.await.unwrap(), "HELLO".to_string());
    }

    #[tokio::test]
    async fn test_actor_context_send_preserves_order() {
        let handle = ActorHandle::<TestActor>::new(Arc::new(AtomicBool::new(false)));
        handle.send(TestMessage::ChainTwice).await.unwrap();
        assert_eq!(read_log(&handle).await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_actor_context_send_with_delay() {
        let handle = ActorHandle::<TestActor>::new(Arc::new(AtomicBool::new(false)));
        handle
            .send(TestMessage::Delayed {
                value: "later".to_string(),
                delay: Duration::from_millis(20),
            })
            .await
            .unwrap();
        assert!(read_log(&handle).await.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(read_log(&handle).await, vec!["later"]);
    }

    #[tokio::test]
    async fn test_actor_stop_cancels_background_tasks() {
        let fired = Arc::new(AtomicBool::new(false));
        let handle = ActorHandle::<TestActor>::new(Arc::clone(&fired));
        handle
            .send(TestMessage::SpawnLate {
                delay: Duration::from_millis(50),
            })
            .await
            .unwrap();
        handle.send(TestMessage::Stop).await.unwrap();
        handle.clone().wait_for_stop().await;
        assert!(handle.is_stopped());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_actor_handle_wait_for_stop() {
        let handle = ActorHandle::<TestActor>::new(Arc::new(AtomicBool::new(false)));
        let result = handle.send(TestMessage::Stop).await;
        assert!(result.is_ok());

        handle.clone().wait_for_stop().await;
        // Multiple handles should be able to wait for the actor to stop.
        handle.wait_for_stop().await;
    }
}
