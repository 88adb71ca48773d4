//! Observation loop tests
//!
//! These drive the loop against a scripted in-memory runtime and a record
//! file in a temporary directory, without a real container runtime.

#[cfg(test)]
mod scripted_runtime_tests {
    use crate::labels::LabelSchema;
    use crate::models::{ContainerObservation, WorkloadIdentity};
    use crate::observer::{build_observation, ObservationLoop, ObservationLoopBuilder, ObserverConfig};
    use crate::runtime::{ContainerRuntime, InspectedContainer, RuntimeError};
    use crate::store::{CsvStore, KnownSet, RetryPolicy, DEFAULT_FILE_NAME};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    #[derive(Clone)]
    enum Behavior {
        Inspect(InspectedContainer),
        Fail,
        Hang,
    }

    /// Runtime whose containers and failures are set by the test
    #[derive(Default)]
    struct ScriptedRuntime {
        containers: Mutex<Vec<(String, Behavior)>>,
        list_fails: AtomicBool,
        list_calls: AtomicUsize,
        inspect_calls: AtomicUsize,
        last_include_stopped: AtomicBool,
    }

    impl ScriptedRuntime {
        fn set(&self, id: &str, behavior: Behavior) {
            let mut containers = self.containers.lock().unwrap();
            match containers.iter_mut().find(|(cid, _)| cid == id) {
                Some(entry) => entry.1 = behavior,
                None => containers.push((id.to_string(), behavior)),
            }
        }

        fn running(&self, id: &str, pid: i64, pod: &str, container: &str) {
            self.set(id, Behavior::Inspect(container_state(id, pid, pod, container, true)));
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn list(&self, include_stopped: bool) -> Result<Vec<String>, RuntimeError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.last_include_stopped
                .store(include_stopped, Ordering::SeqCst);

            if self.list_fails.load(Ordering::SeqCst) {
                return Err(RuntimeError::Unavailable("daemon not responding".into()));
            }

            let containers = self.containers.lock().unwrap();
            Ok(containers.iter().map(|(id, _)| id.clone()).collect())
        }

        async fn inspect(&self, id: &str) -> Result<InspectedContainer, RuntimeError> {
            self.inspect_calls.fetch_add(1, Ordering::SeqCst);

            let behavior = {
                let containers = self.containers.lock().unwrap();
                containers
                    .iter()
                    .find(|(cid, _)| cid == id)
                    .map(|(_, b)| b.clone())
            };

            match behavior {
                Some(Behavior::Inspect(container)) => Ok(container),
                Some(Behavior::Fail) | None => {
                    Err(RuntimeError::Unavailable(format!("no such container: {id}")))
                }
                Some(Behavior::Hang) => std::future::pending().await,
            }
        }
    }

    fn container_state(
        id: &str,
        pid: i64,
        pod: &str,
        container: &str,
        running: bool,
    ) -> InspectedContainer {
        let labels = HashMap::from([
            ("io.kubernetes.pod.name".to_string(), pod.to_string()),
            ("io.kubernetes.container.name".to_string(), container.to_string()),
        ]);

        InspectedContainer {
            id: id.to_string(),
            pid,
            created: "2024-03-01T10:00:00Z".to_string(),
            started_at: "2024-03-01T10:00:01Z".to_string(),
            image: "sha256:0123".to_string(),
            labels,
            running,
        }
    }

    fn test_config() -> ObserverConfig {
        ObserverConfig {
            poll_interval: Duration::from_millis(10),
            inspect_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn test_loop(runtime: Arc<ScriptedRuntime>, dir: &TempDir) -> ObservationLoop {
        let store = CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)).with_retry(RetryPolicy::none());
        ObservationLoopBuilder::new()
            .runtime(runtime)
            .store(store)
            .config(test_config())
            .build()
            .unwrap()
    }

    fn load(dir: &TempDir) -> KnownSet {
        CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)).load().unwrap()
    }

    #[tokio::test]
    async fn test_single_container_scenario() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");

        let mut observer = test_loop(runtime.clone(), &dir);

        let report = observer.poll_cycle().await.unwrap();
        assert_eq!(report.new_records, 1);
        assert!(report.saved);

        let persisted = load(&dir);
        assert_eq!(persisted.len(), 1);
        let row = &persisted.as_slice()[0];
        assert_eq!(row.pid, 100);
        assert_eq!(row.identity.pod_name, "job-1");
        assert_eq!(row.identity.container_name, "main");
        assert!(row.identity.app_label.is_empty());
        assert!(row.identity.run_name.is_empty());
        assert!(row.identity.process_name.is_empty());
        assert!(row.identity.session_id.is_empty());
        assert!(row.identity.task_name.is_empty());

        let report = observer.poll_cycle().await.unwrap();
        assert_eq!(report.new_records, 0);
        assert!(!report.saved);
        assert_eq!(load(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_observation_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");
        runtime.running("c2", 200, "job-2", "main");

        let mut observer = test_loop(runtime.clone(), &dir);
        for _ in 0..20 {
            observer.poll_cycle().await.unwrap();
        }

        assert_eq!(observer.known().len(), 2);
        assert_eq!(load(&dir).len(), 2);
    }

    #[tokio::test]
    async fn test_single_save_for_many_new_containers() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        for i in 0..5 {
            runtime.running(&format!("c{i}"), 100 + i, &format!("job-{i}"), "main");
        }

        let mut observer = test_loop(runtime, &dir);
        let report = observer.poll_cycle().await.unwrap();

        assert_eq!(report.listed, 5);
        assert_eq!(report.new_records, 5);
        assert!(report.saved);

        let pids: Vec<i64> = load(&dir).iter().map(|o| o.pid).collect();
        assert_eq!(pids, vec![100, 101, 102, 103, 104]);
    }

    #[tokio::test]
    async fn test_inspect_failure_isolated() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");
        runtime.set("c2", Behavior::Fail);
        runtime.running("c3", 300, "job-3", "main");

        let mut observer = test_loop(runtime.clone(), &dir);
        let report = observer.poll_cycle().await.unwrap();

        assert_eq!(report.listed, 3);
        assert_eq!(report.inspect_errors, 1);
        assert_eq!(report.new_records, 2);
        assert_eq!(runtime.inspect_calls.load(Ordering::SeqCst), 3);

        let pods: Vec<String> = load(&dir)
            .iter()
            .map(|o| o.identity.pod_name.clone())
            .collect();
        assert_eq!(pods, vec!["job-1", "job-3"]);
    }

    #[tokio::test]
    async fn test_hung_inspect_times_out() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.set("stuck", Behavior::Hang);
        runtime.running("c2", 200, "job-2", "main");

        let mut observer = test_loop(runtime, &dir);
        let report = tokio::time::timeout(Duration::from_secs(5), observer.poll_cycle())
            .await
            .expect("cycle should not hang")
            .unwrap();

        assert_eq!(report.inspect_errors, 1);
        assert_eq!(report.new_records, 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_transient() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");
        runtime.list_fails.store(true, Ordering::SeqCst);

        let mut observer = test_loop(runtime.clone(), &dir);
        let report = observer.poll_cycle().await.unwrap();
        assert!(report.list_failed);
        assert!(!report.saved);
        assert!(!dir.path().join(DEFAULT_FILE_NAME).exists());

        runtime.list_fails.store(false, Ordering::SeqCst);
        let report = observer.poll_cycle().await.unwrap();
        assert!(!report.list_failed);
        assert_eq!(report.new_records, 1);
    }

    #[tokio::test]
    async fn test_stopped_containers_skipped() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.set(
            "exited",
            Behavior::Inspect(container_state("exited", 0, "job-0", "main", false)),
        );
        runtime.running("c1", 100, "job-1", "main");

        let mut observer = test_loop(runtime.clone(), &dir);
        let report = observer.poll_cycle().await.unwrap();

        assert!(runtime.last_include_stopped.load(Ordering::SeqCst));
        assert_eq!(report.skipped_not_running, 1);
        assert_eq!(report.new_records, 1);
        assert_eq!(observer.known().as_slice()[0].identity.pod_name, "job-1");
    }

    #[tokio::test]
    async fn test_include_stopped_is_passed_through() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.last_include_stopped.store(true, Ordering::SeqCst);

        let mut observer = ObservationLoopBuilder::new()
            .runtime(runtime.clone())
            .store(CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)))
            .include_stopped(false)
            .build()
            .unwrap();
        observer.poll_cycle().await.unwrap();

        assert!(!runtime.last_include_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pid_reuse_by_other_pod_is_recorded() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");

        let mut observer = test_loop(runtime.clone(), &dir);
        observer.poll_cycle().await.unwrap();

        // c1 exits and an unrelated container comes up with the same pid
        runtime.set(
            "c1",
            Behavior::Inspect(container_state("c1", 100, "job-1", "main", false)),
        );
        runtime.running("c2", 100, "job-2", "main");
        let report = observer.poll_cycle().await.unwrap();

        assert_eq!(report.new_records, 1);
        assert_eq!(load(&dir).len(), 2);
    }

    #[tokio::test]
    async fn test_startup_seeding_from_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = CsvStore::new(dir.path().join(DEFAULT_FILE_NAME));

        let prior: KnownSet = (0..4)
            .map(|i| ContainerObservation {
                pid: 10 + i,
                created_at: String::new(),
                started_at: String::new(),
                image: String::new(),
                identity: WorkloadIdentity {
                    pod_name: format!("old-{i}"),
                    container_name: "main".to_string(),
                    ..Default::default()
                },
            })
            .collect();
        store.save(&prior).unwrap();

        let runtime = Arc::new(ScriptedRuntime::default());
        // one container already recorded, one genuinely new
        runtime.running("c-old", 10, "old-0", "main");
        runtime.running("c-new", 500, "fresh", "main");

        let mut observer = test_loop(runtime, &dir);
        assert_eq!(observer.known().len(), 4);

        let report = observer.poll_cycle().await.unwrap();
        assert_eq!(report.new_records, 1);

        let persisted = load(&dir);
        assert_eq!(persisted.len(), 5);
        assert_eq!(persisted.as_slice()[4].identity.pod_name, "fresh");
    }

    #[tokio::test]
    async fn test_bare_schema_extraction() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        let mut state = container_state("c1", 100, "job-1", "main", true);
        state.labels.insert("runName".to_string(), "sleepy_curie".to_string());
        state
            .labels
            .insert("nextflow.io/runName".to_string(), "ignored".to_string());
        runtime.set("c1", Behavior::Inspect(state));

        let mut observer = ObservationLoopBuilder::new()
            .runtime(runtime)
            .store(CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)))
            .schema(LabelSchema::bare())
            .build()
            .unwrap();
        observer.poll_cycle().await.unwrap();

        assert_eq!(load(&dir).as_slice()[0].identity.run_name, "sleepy_curie");
    }

    #[tokio::test]
    async fn test_save_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);

        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");

        let mut observer = ObservationLoopBuilder::new()
            .runtime(runtime)
            .store(CsvStore::new(&path).with_retry(RetryPolicy::none()))
            .known_set(KnownSet::new())
            .build()
            .unwrap();

        // Occupy the destination with a non-empty directory so the rename fails
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        assert!(observer.poll_cycle().await.is_err());
    }

    #[tokio::test]
    async fn test_build_fails_on_corrupt_record_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_FILE_NAME);
        std::fs::write(&path, "Pid,Created\nnot-a-number,x\n").unwrap();

        let result = ObservationLoopBuilder::new()
            .runtime(Arc::new(ScriptedRuntime::default()))
            .store(CsvStore::new(&path))
            .build();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_builder_requires_runtime_and_store() {
        let dir = TempDir::new().unwrap();

        let missing_runtime = ObservationLoopBuilder::new()
            .store(CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)))
            .build();
        assert!(missing_runtime.is_err());

        let missing_store = ObservationLoopBuilder::new()
            .runtime(Arc::new(ScriptedRuntime::default()))
            .build();
        assert!(missing_store.is_err());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.running("c1", 100, "job-1", "main");

        let observer = test_loop(runtime.clone(), &dir);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(observer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        runtime.running("c2", 200, "job-2", "main");
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();
        assert!(result.is_ok());

        // several cycles ran, each container recorded once
        assert!(runtime.list_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(load(&dir).len(), 2);
    }

    #[tokio::test]
    async fn test_run_sleeps_between_cycles() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.list_fails.store(true, Ordering::SeqCst);

        let observer = ObservationLoopBuilder::new()
            .runtime(runtime.clone())
            .store(CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)))
            .poll_interval(Duration::from_millis(200))
            .build()
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(observer.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(shutdown_tx);
        handle.await.unwrap().unwrap();

        // a failing list must not spin: only the first cycle ran before the sleep
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_metrics_textfile_written_each_cycle() {
        let dir = TempDir::new().unwrap();
        let textfile = dir.path().join("pidfinder.prom");
        let runtime = Arc::new(ScriptedRuntime::default());

        let mut config = test_config();
        config.metrics_textfile = Some(textfile.clone());
        let mut observer = ObservationLoopBuilder::new()
            .runtime(runtime)
            .store(CsvStore::new(dir.path().join(DEFAULT_FILE_NAME)))
            .config(config)
            .build()
            .unwrap();
        observer.poll_cycle().await.unwrap();

        let text = std::fs::read_to_string(textfile).unwrap();
        assert!(text.contains("pidfinder_poll_cycles_total"));
    }

    #[test]
    fn test_build_observation_defaults_pid() {
        let state = InspectedContainer {
            id: "c1".to_string(),
            running: true,
            ..Default::default()
        };

        let obs = build_observation(state, &LabelSchema::kubernetes());
        assert_eq!(obs.pid, 0);
        assert_eq!(obs.identity, WorkloadIdentity::default());
    }
}
