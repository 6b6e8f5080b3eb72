//! Tests for the scheduler workers, run against a scripted controller

#[cfg(test)]
mod tests {
    use super::super::informers::InformerKind;
    use super::super::scheduler::*;
    use super::super::Controller;
    use crate::crd::Condition;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc, Semaphore};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    const WATCHES: &[InformerKind] = &[InformerKind::Olm];
    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(300);

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Succeed,
        Fail,
        Panic,
    }

    struct RecordingSink {
        published: mpsc::UnboundedSender<Vec<Condition>>,
    }

    #[async_trait]
    impl ConditionSink for RecordingSink {
        async fn publish(&self, conditions: Vec<Condition>) -> Result<()> {
            let _ = self.published.send(conditions);
            Ok(())
        }
    }

    /// Plays `script` one step per sync, succeeding once it runs out. Each sync
    /// announces itself on `started` and, when gated, waits for a permit.
    struct ScriptedController {
        script: Mutex<VecDeque<Step>>,
        syncs: AtomicUsize,
        started: mpsc::UnboundedSender<usize>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl Controller for ScriptedController {
        fn name(&self) -> &str {
            "Scripted"
        }

        fn watches(&self) -> &[InformerKind] {
            WATCHES
        }

        async fn sync(&self, _token: &CancellationToken) -> Result<()> {
            let count = self.syncs.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.started.send(count);
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Succeed);
            match step {
                Step::Succeed => Ok(()),
                Step::Fail => Err(Error::io(
                    "catalogd/01-configmap.yaml",
                    std::io::Error::other("boom"),
                )),
                Step::Panic => panic!("scripted panic"),
            }
        }
    }

    struct Harness {
        events: broadcast::Sender<InformerKind>,
        published: mpsc::UnboundedReceiver<Vec<Condition>>,
        started: mpsc::UnboundedReceiver<usize>,
        token: CancellationToken,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(script: Vec<Step>, gate: Option<Arc<Semaphore>>) -> Self {
            let (events, _) = broadcast::channel(16);
            let (published_tx, published) = mpsc::unbounded_channel();
            let (started_tx, started) = mpsc::unbounded_channel();
            let controller: Arc<dyn Controller> = Arc::new(ScriptedController {
                script: Mutex::new(script.into()),
                syncs: AtomicUsize::new(0),
                started: started_tx,
                gate,
            });
            let sink = Arc::new(RecordingSink {
                published: published_tx,
            });
            let token = CancellationToken::new();
            let scheduler = Scheduler::new(vec![controller], events.clone(), sink)
                .with_resync_interval(Duration::from_secs(3600));
            let task = tokio::spawn(scheduler.run(token.clone()));
            Self {
                events,
                published,
                started,
                token,
                task,
            }
        }

        async fn next_condition(&mut self) -> Condition {
            let mut conditions = timeout(WAIT, self.published.recv())
                .await
                .expect("condition published")
                .expect("sink open");
            assert_eq!(conditions.len(), 1);
            conditions.remove(0)
        }

        async fn next_sync(&mut self) -> usize {
            timeout(WAIT, self.started.recv())
                .await
                .expect("sync started")
                .expect("controller alive")
        }

        async fn assert_idle(&mut self) {
            assert!(timeout(QUIET, self.started.recv()).await.is_err());
        }

        fn wake(&self, kind: InformerKind) {
            self.events.send(kind).unwrap();
        }

        async fn stop(self) {
            self.token.cancel();
            timeout(WAIT, self.task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_failure_degrades_and_success_recovers() {
        let mut harness = Harness::start(vec![Step::Fail, Step::Succeed], None);

        let degraded = harness.next_condition().await;
        assert_eq!(degraded.type_, "ScriptedDegraded");
        assert_eq!(degraded.status, "True");
        assert_eq!(degraded.reason, "SyncError");
        assert!(degraded.message.contains("boom"));

        harness.wake(InformerKind::Olm);
        let recovered = harness.next_condition().await;
        assert_eq!(recovered.type_, "ScriptedDegraded");
        assert_eq!(recovered.status, "False");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_worker_keeps_running() {
        let mut harness = Harness::start(vec![Step::Panic], None);

        let degraded = harness.next_condition().await;
        assert_eq!(degraded.status, "True");
        assert_eq!(degraded.message, "sync panicked");

        harness.wake(InformerKind::Olm);
        assert_eq!(harness.next_condition().await.status, "False");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_events_during_sync_coalesce_into_one_follow_up() {
        let gate = Arc::new(Semaphore::new(0));
        let mut harness = Harness::start(Vec::new(), Some(gate.clone()));

        assert_eq!(harness.next_sync().await, 1);
        for _ in 0..5 {
            harness.wake(InformerKind::Olm);
        }
        gate.add_permits(1);
        assert_eq!(harness.next_condition().await.status, "False");

        assert_eq!(harness.next_sync().await, 2);
        gate.add_permits(1);
        assert_eq!(harness.next_condition().await.status, "False");
        harness.assert_idle().await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unwatched_informers_do_not_wake_the_worker() {
        let mut harness = Harness::start(Vec::new(), None);
        assert_eq!(harness.next_sync().await, 1);
        harness.next_condition().await;

        harness.wake(InformerKind::HelmSecrets);
        harness.assert_idle().await;

        harness.wake(InformerKind::Olm);
        assert_eq!(harness.next_sync().await, 2);

        harness.stop().await;
    }
}
