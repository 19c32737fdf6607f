pub mod pool;
pub mod scheduler;
pub mod supervisor;

#[cfg(test)]
mod pool_test;
#[cfg(test)]
mod scheduler_test;

use std::{fmt::Debug, sync::Arc};

/// Long running thread owned and restarted by the supervisor.
pub trait SupervisedThread: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Body of the thread, returns once interrupted.
    fn run(self: Arc<Self>);

    /// Ask the thread to stop, may be called more than once.
    fn interrupt(&self);
}
