//! In-memory pipeline environment.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, NewInboundUpdate, NewOutboundMessage, TestClock};
use courier_delivery::{
    storage::mock::MockQueueStore, Enqueuer, Ingestor, MockIdempotencyGuard, Pipeline,
    PipelineConfig, PipelineParts, WorkerConfig,
};

use crate::{api::ScriptedApiClient, router::RecordingRouter};

/// Mock stores, scripted collaborators and a shared clock.
///
/// Everything handed out by the environment observes the same clock, so
/// advancing it moves leases, backoff schedules and pacing together.
pub struct TestEnv {
    /// Shared clock.
    pub clock: Arc<dyn Clock>,
    /// Inbound queue.
    pub inbound: Arc<MockQueueStore<NewInboundUpdate>>,
    /// Outbound queue.
    pub outbound: Arc<MockQueueStore<NewOutboundMessage>>,
    /// Idempotency guard.
    pub guard: Arc<MockIdempotencyGuard>,
    /// Platform API double.
    pub api: Arc<ScriptedApiClient>,
    /// Business router double.
    pub router: Arc<RecordingRouter>,
    test_clock: Option<TestClock>,
}

impl TestEnv {
    /// Environment on a manually advanced [`TestClock`].
    pub fn new() -> Self {
        let test_clock = TestClock::new();
        let mut env = Self::with_clock(Arc::new(test_clock.clone()));
        env.test_clock = Some(test_clock);
        env
    }

    /// Environment on an arbitrary clock, typically `RealClock` under a
    /// paused tokio runtime.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            api: Arc::new(ScriptedApiClient::new(clock.clone())),
            clock,
            inbound: Arc::new(MockQueueStore::new()),
            outbound: Arc::new(MockQueueStore::new()),
            guard: Arc::new(MockIdempotencyGuard::new()),
            router: Arc::new(RecordingRouter::new()),
            test_clock: None,
        }
    }

    /// Replaces the API double.
    #[must_use]
    pub fn with_api(mut self, api: ScriptedApiClient) -> Self {
        self.api = Arc::new(api);
        self
    }

    /// Replaces the router double.
    #[must_use]
    pub fn with_router(mut self, router: RecordingRouter) -> Self {
        self.router = Arc::new(router);
        self
    }

    /// Advances the test clock.
    ///
    /// # Panics
    ///
    /// Panics if the environment was built on another clock.
    pub fn advance(&self, duration: Duration) {
        match &self.test_clock {
            Some(clock) => clock.advance(duration),
            None => panic!("advance requires a TestClock environment"),
        }
    }

    /// Ingestor writing to the inbound queue.
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.guard.clone(), self.inbound.clone(), self.clock.clone())
    }

    /// Enqueuer writing to the outbound queue.
    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(self.outbound.clone(), self.clock.clone())
    }

    /// Pipeline over this environment's collaborators.
    pub fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        let parts = PipelineParts {
            inbound_store: self.inbound.clone(),
            outbound_store: self.outbound.clone(),
            client: self.api.clone(),
            router: self.router.clone(),
            clock: self.clock.clone(),
        };
        Pipeline::new(parts, config)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration with small, fast values for tests.
///
/// Backoff starts at one second, so retry schedules are easy to step
/// through with [`TestEnv::advance`].
pub fn fast_config() -> PipelineConfig {
    let worker = WorkerConfig {
        poll_interval: Duration::from_millis(50),
        batch_size: 10,
        lease: Duration::from_secs(30),
        max_attempts: 3,
        max_concurrency: 4,
    };

    PipelineConfig {
        inbound: worker.clone(),
        outbound: worker,
        destination_interval: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(5),
        call_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}
