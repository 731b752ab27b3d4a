use tokio::runtime::Handle;
use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs blocking jobs strictly one after another, in submission order.
///
/// Each job runs on tokio's blocking pool, but the next job is only started once the
/// previous one has finished, so jobs never overlap.
#[derive(Debug, Clone)]
pub struct Sequencer {
    name: &'static str,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Sequencer {
    pub fn new(name: &'static str, runtime: &Handle) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let spawner = runtime.clone();
        runtime.spawn(async move {
            while let Some(job) = queue.recv().await {
                if let Err(error) = spawner.spawn_blocking(job).await {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        sequencer = name,
                        "sequenced job panicked"
                    );
                }
            }
            tracing::debug!(sequencer = name, "sequencer stopped");
        });

        Self { name, jobs }
    }

    /// Queues `job`. Returns `false` if the sequencer is gone and the job was dropped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            tracing::warn!(sequencer = self.name, "dropping job for stopped sequencer");
            return false;
        }
        true
    }
}
