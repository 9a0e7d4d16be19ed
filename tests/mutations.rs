//! Tests for mutations, mutation instances and their hooks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use query_cache::{
    Mutation, MutationHooks, MutationOutcome, QueryCacheError, QueryClient, Tracer,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Saved {
    id: u32,
}

/// Collects hook invocations in the order they ran.
#[derive(Clone, Default)]
struct HookLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl HookLog {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn hooks(&self) -> MutationHooks<Saved, u32> {
        let (a, b, c, d, e) = (
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
        );
        MutationHooks::new()
            .on_mutate(move |params: u32| {
                let log = a.clone();
                async move { log.push(format!("mutate {params}")) }
            })
            .on_success(move |data: Saved| {
                let log = b.clone();
                async move { log.push(format!("success {}", data.id)) }
            })
            .on_error(move |error: Arc<anyhow::Error>| {
                let log = c.clone();
                async move { log.push(format!("error {error}")) }
            })
            .on_cancel(move |reason: QueryCacheError| {
                let log = d.clone();
                async move { log.push(format!("cancel {}", reason.is_cancelled())) }
            })
            .on_settled(move || {
                let log = e.clone();
                async move { log.push("settled") }
            })
    }

    /// Wait until `count` events were recorded; hooks run detached.
    async fn wait_for(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.events.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }
}

fn echo_mutation(client: &QueryClient) -> Mutation<Saved, u32> {
    client
        .create_mutation("echo", |id: u32| async move { anyhow::Ok(Saved { id }) })
        .unwrap()
}

// =============================================================================
// Registry
// =============================================================================

#[tokio::test]
async fn test_create_mutation_is_idempotent() {
    let client = QueryClient::new().unwrap();
    let first = echo_mutation(&client);
    let second: Mutation<Saved, u32> = client.create_mutation("echo", |_: u32| async {
        anyhow::Ok(Saved { id: 0 })
    })
    .unwrap();

    assert!(first.ptr_eq(&second));
    assert_eq!(second.id(), "echo");
    assert_eq!(second.mutate(5).await.unwrap(), Saved { id: 5 });
}

#[tokio::test]
async fn test_direct_mutate_reports_failure() {
    let client = QueryClient::new().unwrap();
    let mutation: Mutation<Saved, u32> = client.create_mutation("reject", |_: u32| async {
        Err::<Saved, _>(anyhow::anyhow!("rejected"))
    })
    .unwrap();

    let error = mutation.mutate(1).await.unwrap_err();
    assert_eq!(error.to_string(), "rejected");
    assert!(!error.is_cancelled());
    assert!(!client.is_mutating());
}

// =============================================================================
// Instances
// =============================================================================

#[tokio::test]
async fn test_instance_success_state_and_hooks() {
    let client = QueryClient::new().unwrap();
    let log = HookLog::default();
    let instance = echo_mutation(&client).subscribe(log.hooks());

    instance.mutate(3);
    instance.settled().await;

    assert_eq!(instance.data(), Some(Saved { id: 3 }));
    assert!(instance.is_success());
    assert!(!instance.is_error());
    assert!(!instance.is_mutating());
    assert!(instance.error().is_none());

    log.wait_for(3).await;
    let events = log.events();
    assert!(events.contains(&"mutate 3".to_string()));
    assert!(events.contains(&"success 3".to_string()));
    assert!(events.contains(&"settled".to_string()));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_instance_failure_state_and_hooks() {
    let client = QueryClient::new().unwrap();
    let log = HookLog::default();
    let mutation: Mutation<Saved, u32> = client.create_mutation("broken", |_: u32| async {
        Err::<Saved, _>(anyhow::anyhow!("disk full"))
    })
    .unwrap();
    let instance = mutation.subscribe(log.hooks());

    instance.mutate(1);
    instance.settled().await;

    assert!(instance.is_error());
    assert!(!instance.is_success());
    assert_eq!(instance.error().unwrap().to_string(), "disk full");
    assert_eq!(instance.data(), None);

    log.wait_for(3).await;
    assert!(log.events().contains(&"error disk full".to_string()));
}

#[tokio::test]
async fn test_last_call_wins() {
    let client = QueryClient::new().unwrap();
    let started = Arc::new(Notify::new());
    let mutation: Mutation<Saved, u32> = {
        let started = started.clone();
        client.create_mutation("slow-first", move |id: u32| {
            let started = started.clone();
            async move {
                if id == 1 {
                    started.notify_one();
                    std::future::pending::<()>().await;
                }
                anyhow::Ok(Saved { id })
            }
        })
        .unwrap()
    };
    let log = HookLog::default();
    let instance = mutation.subscribe(log.hooks());

    instance.mutate(1);
    started.notified().await;
    instance.mutate(2);
    instance.settled().await;

    assert_eq!(instance.data(), Some(Saved { id: 2 }));
    assert!(instance.is_success());
    assert!(!instance.is_error());
    assert!(!instance.is_mutating());

    // mutate, cancel, settled for the first call; mutate, success, settled
    // for the second.
    log.wait_for(6).await;
    let events = log.events();
    assert!(events.contains(&"cancel true".to_string()));
    assert!(events.contains(&"success 2".to_string()));
    assert!(!events.iter().any(|e| e.starts_with("error")));
}

#[tokio::test]
async fn test_cancel_running_call() {
    let client = QueryClient::new().unwrap();
    let started = Arc::new(Notify::new());
    let mutation: Mutation<Saved, u32> = {
        let started = started.clone();
        client.create_mutation("hang", move |_: u32| {
            let started = started.clone();
            async move {
                started.notify_one();
                std::future::pending::<()>().await;
                anyhow::Ok(Saved { id: 0 })
            }
        })
        .unwrap()
    };
    let instance = mutation.subscribe(MutationHooks::new());

    // Idle cancel is a no-op.
    instance.cancel();

    instance.mutate(1);
    started.notified().await;
    assert!(instance.is_mutating());
    assert!(mutation.is_mutating());
    assert!(client.is_mutating());

    instance.cancel();
    instance.settled().await;
    assert!(!instance.is_mutating());
    assert!(!instance.is_error());
    assert!(!instance.is_success());
    assert!(!client.is_mutating());
}

#[tokio::test]
async fn test_dropping_instance_cancels_call() {
    let client = QueryClient::new().unwrap();
    let started = Arc::new(Notify::new());
    let mutation: Mutation<Saved, u32> = {
        let started = started.clone();
        client.create_mutation("abandoned", move |_: u32| {
            let started = started.clone();
            async move {
                started.notify_one();
                std::future::pending::<()>().await;
                anyhow::Ok(Saved { id: 0 })
            }
        })
        .unwrap()
    };
    let mut mutating = client.watch_mutating();
    let instance = mutation.subscribe(MutationHooks::new());

    instance.mutate(1);
    started.notified().await;
    assert!(client.is_mutating());

    instance.dispose();
    tokio::time::timeout(Duration::from_secs(5), mutating.wait_for(|active| !*active))
        .await
        .unwrap()
        .unwrap();
}

// =============================================================================
// Save Scenario
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_save_fails_then_succeeds() {
    let client = QueryClient::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = mpsc::unbounded_channel::<()>();
    let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

    let save: Mutation<Saved, u32> = {
        let calls = calls.clone();
        client.create_mutation("save", move |_: u32| {
            let calls = calls.clone();
            let release_rx = release_rx.clone();
            async move {
                release_rx.lock().await.recv().await;
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("network error");
                }
                Ok(Saved { id: 1 })
            }
        })
        .unwrap()
    };
    let mut mutating = client.watch_mutating();
    assert!(!*mutating.borrow_and_update());

    let first = save.subscribe(MutationHooks::new());
    first.mutate(1);
    mutating.wait_for(|active| *active).await.unwrap();
    release_tx.send(()).unwrap();
    first.settled().await;
    assert!(first.is_error());
    assert!(!client.is_mutating());

    let second = save.subscribe(MutationHooks::new());
    second.mutate(1);
    mutating.wait_for(|active| *active).await.unwrap();
    assert!(client.is_mutating());
    release_tx.send(()).unwrap();
    second.settled().await;

    assert!(second.is_success());
    assert_eq!(second.data(), Some(Saved { id: 1 }));
    assert!(first.is_error());
    assert!(!client.is_mutating());
    assert!(!save.is_mutating());
}

// =============================================================================
// Tracer
// =============================================================================

#[derive(Clone, Default)]
struct MutationTracer {
    events: Arc<Mutex<Vec<String>>>,
}

impl Tracer for MutationTracer {
    fn on_mutation_created(&self, id: &str) {
        self.events.lock().push(format!("created {id}"));
    }

    fn on_mutation_start(&self, id: &str) {
        self.events.lock().push(format!("start {id}"));
    }

    fn on_mutation_end(&self, id: &str, outcome: &MutationOutcome) {
        self.events.lock().push(format!("end {id} {outcome:?}"));
    }
}

#[tokio::test]
async fn test_tracer_sees_mutation_lifecycle() {
    let tracer = MutationTracer::default();
    let client = QueryClient::builder().tracer(tracer.clone()).build().unwrap();
    let instance = echo_mutation(&client).subscribe(MutationHooks::new());
    let _again = echo_mutation(&client);

    instance.mutate(9);
    instance.settled().await;

    assert_eq!(
        *tracer.events.lock(),
        vec![
            "created echo".to_string(),
            "start echo".to_string(),
            "end echo Success".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_mutation_yields_one_instance() {
    let tracer = MutationTracer::default();
    let client = QueryClient::builder().tracer(tracer.clone()).build().unwrap();
    let barrier = Arc::new(tokio::sync::Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                echo_mutation(&client)
            })
        })
        .collect();

    let mut mutations = Vec::new();
    for handle in handles {
        mutations.push(handle.await.unwrap());
    }
    assert!(mutations.iter().all(|m| m.ptr_eq(&mutations[0])));
    assert_eq!(*tracer.events.lock(), vec!["created echo".to_string()]);
}

#[tokio::test]
async fn test_same_id_with_other_types_is_rejected() {
    let client = QueryClient::new().unwrap();
    let _echo = echo_mutation(&client);
    let other = client.create_mutation("echo", |name: String| async move { anyhow::Ok(name) });

    assert!(matches!(
        other,
        Err(QueryCacheError::TypeMismatch { ref key, .. }) if key == "echo"
    ));
}
