//! Single-owner event loop and the bridge other threads use to reach it.
//!
//! All socket I/O runs on one dedicated thread driving a current-thread tokio
//! runtime. Producer threads never touch sockets; they hand a job to the loop
//! through [`LoopBridge::submit_and_wait`], which enqueues it on a bounded
//! channel and blocks on that job's own `oneshot` reply.

use std::future::Future;
use std::io;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use futures::future::BoxFuture;
use logcast_core::BridgeError;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Readiness of the event loop as seen through a [`LoopBridge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    Running,
}

struct Published {
    jobs: mpsc::Sender<Job>,
    loop_thread: ThreadId,
}

/// Handle to the event loop, created before the loop starts and shared by
/// every component that submits work to it.
///
/// The loop publishes itself exactly once via [`LoopBridge::attach`]; from then
/// on the handle stays valid. Cloning shares the same publication point.
#[derive(Clone, Default)]
pub struct LoopBridge {
    inner: Arc<OnceLock<Published>>,
}

impl LoopBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoopState {
        if self.inner.get().is_some() {
            LoopState::Running
        } else {
            LoopState::NotStarted
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Publish the calling thread as the loop and start the job worker.
    ///
    /// Must be called from inside the loop's runtime. Returns `false` (and
    /// starts nothing) if a loop was already published on this bridge.
    pub fn attach(&self, queue_capacity: usize) -> bool {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let published = Published {
            jobs: tx,
            loop_thread: thread::current().id(),
        };
        if self.inner.set(published).is_err() {
            return false;
        }
        tokio::spawn(run_jobs(rx));
        true
    }

    /// Run `work` on the loop and block the calling thread until it finishes.
    ///
    /// Failures never cross the thread boundary as panics: a missing loop, a
    /// loop that has exited, and work that panicked all come back as a
    /// [`BridgeError`]. Calling this from the loop thread itself returns
    /// [`BridgeError::Reentrant`] instead of deadlocking.
    pub fn submit_and_wait<F, Fut, T>(&self, work: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let published = self.inner.get().ok_or(BridgeError::LoopUnavailable)?;
        if thread::current().id() == published.loop_thread {
            return Err(BridgeError::Reentrant);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let out = work().await;
                let _ = reply_tx.send(out);
            })
        });

        futures::executor::block_on(async {
            published
                .jobs
                .send(job)
                .await
                .map_err(|_| BridgeError::LoopClosed)?;
            reply_rx.await.map_err(|_| BridgeError::WorkAborted)
        })
    }
}

impl std::fmt::Debug for LoopBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopBridge")
            .field("state", &self.state())
            .finish()
    }
}

/// Drain the job queue, running each job as its own task on the loop.
///
/// A job that panics takes down only its own task; its reply sender is
/// dropped and the waiting caller sees [`BridgeError::WorkAborted`].
async fn run_jobs(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        tokio::spawn(job());
    }
    tracing::debug!("event loop job queue closed");
}

/// Start a dedicated thread driving a current-thread runtime until `body`
/// completes.
pub fn spawn_loop_thread<F, Fut>(
    name: &str,
    body: F,
) -> io::Result<thread::JoinHandle<io::Result<()>>>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()>,
{
    thread::Builder::new().name(name.to_owned()).spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(body());
        Ok(())
    })
}
