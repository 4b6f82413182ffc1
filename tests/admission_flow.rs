//! End-to-end admission flow through a fully built runtime: rate limiting,
//! cache short-circuits, queue backpressure, streaming and durable sessions.

use async_trait::async_trait;
use rag_gate::gateway::GenerationRequest;
use rag_gate::{
    BoxError, ChatRequest, Error, Generator, Retriever, Runtime, ScoredChunk, Settings,
    StreamEvent,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;

struct Handbook {
    calls: AtomicUsize,
}

#[async_trait]
impl Retriever for Handbook {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            ScoredChunk::new(
                format!("Section on {query}: employees get 20 vacation days."),
                "handbook.pdf",
                0.91,
            )
            .with_page(12);
            k.min(2)
        ])
    }
}

/// Answers only when a permit is available, so tests decide when
/// generation finishes.
struct GatedModel {
    permits: Arc<Semaphore>,
    calls: AtomicUsize,
}

impl GatedModel {
    fn open() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(Semaphore::MAX_PERMITS)),
            calls: AtomicUsize::new(0),
        }
    }

    fn closed() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Generator for GatedModel {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.permits.acquire().await?.forget();
        Ok(format!(
            "{} (with {} earlier messages)",
            request.question,
            request.history.len()
        ))
    }
}

async fn runtime_with(
    settings: Settings,
    retriever: Arc<Handbook>,
    generator: Arc<GatedModel>,
) -> Runtime {
    Runtime::builder(settings)
        .retriever(retriever)
        .generator(generator)
        .build()
        .await
        .unwrap()
}

fn handbook() -> Arc<Handbook> {
    Arc::new(Handbook {
        calls: AtomicUsize::new(0),
    })
}

fn base_settings() -> Settings {
    Settings::from_yaml_str(
        r#"
rate_limit: { capacity: 10, refill_rate: 0.5 }
queue: { max_concurrent: 2, max_size: 4, task_timeout: 30 }
sweep_interval: 60
"#,
    )
    .unwrap()
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let retriever = handbook();
    let model = Arc::new(GatedModel::open());
    let rt = runtime_with(base_settings(), retriever.clone(), model.clone()).await;

    let first = rt
        .gateway()
        .ask("10.0.0.1", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(first.sources.len(), 2);
    assert_eq!(first.sources[0].page, Some(12));

    // different client, new session, same question
    let second = rt
        .gateway()
        .ask("10.0.0.2", ChatRequest::new("  Vacation   DAYS "))
        .await
        .unwrap();
    assert!(second.cached);
    assert_eq!(second.answer, first.answer);
    assert_ne!(second.session_id, first.session_id);

    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    let stats = rt.stats();
    assert_eq!(stats.queue.submitted, 1);
    assert!(stats.answer_cache.hits >= 1);

    // the cached turn is still recorded
    let session = rt.gateway().sessions().get(&second.session_id).await.unwrap();
    assert_eq!(session.messages().len(), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn changed_documents_force_a_fresh_search() {
    let retriever = handbook();
    let rt = runtime_with(base_settings(), retriever.clone(), Arc::new(GatedModel::open())).await;
    let gateway = rt.gateway();

    gateway.ask("a", ChatRequest::new("vacation days")).await.unwrap();
    gateway.ask("b", ChatRequest::new("vacation days")).await.unwrap();
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);

    assert_eq!(rt.documents_changed(), 1);
    assert!(rt.components().retrieval_cache.is_empty());

    gateway.ask("c", ChatRequest::new("vacation days")).await.unwrap();
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
    // nothing left to drop twice in a row
    assert_eq!(gateway.invalidate_retrieval(), 1);
    assert_eq!(gateway.invalidate_retrieval(), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn scoped_questions_do_not_share_search_results() {
    let retriever = handbook();
    let rt = runtime_with(base_settings(), retriever.clone(), Arc::new(GatedModel::open())).await;
    let gateway = rt.gateway();

    for scope in [None, Some("hr"), Some("legal"), Some("hr")] {
        let mut request = ChatRequest::new("vacation days");
        if let Some(scope) = scope {
            request = request.with_scope(scope);
        }
        gateway.ask("client", request).await.unwrap();
    }
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 3);
    assert_eq!(rt.components().retrieval_cache.len(), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn enormous_durations_act_as_no_expiry() {
    let settings = Settings::from_yaml_str(
        r#"
answer_cache: { ttl: 1.0e19 }
retrieval_cache: { ttl: 1.0e19 }
sessions: { ttl: 1.0e19 }
queue: { max_concurrent: 1, max_size: 2, task_timeout: 1.0e19 }
sweep_interval: 60
"#,
    )
    .unwrap();
    let rt = runtime_with(settings, handbook(), Arc::new(GatedModel::open())).await;

    let first = rt
        .gateway()
        .ask("client", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    let second = rt
        .gateway()
        .ask("client", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    let report = rt.sweep_now().await;
    assert_eq!(report.total(), 0);
    rt.shutdown().await;
}

#[tokio::test]
async fn follow_up_turns_see_history_and_skip_the_answer_cache() {
    let model = Arc::new(GatedModel::open());
    let rt = runtime_with(base_settings(), handbook(), model.clone()).await;

    let first = rt
        .gateway()
        .ask("client", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    let follow_up = rt
        .gateway()
        .ask(
            "client",
            ChatRequest::new("vacation days").with_session(first.session_id.clone()),
        )
        .await
        .unwrap();

    assert!(!follow_up.cached);
    assert_eq!(follow_up.session_id, first.session_id);
    assert!(follow_up.answer.ends_with("(with 2 earlier messages)"));
    assert_eq!(model.calls.load(Ordering::SeqCst), 2);

    let session = rt.gateway().sessions().get(&first.session_id).await.unwrap();
    assert_eq!(session.messages().len(), 4);
    rt.shutdown().await;
}

#[tokio::test]
async fn unknown_session_id_starts_a_new_conversation() {
    let rt = runtime_with(base_settings(), handbook(), Arc::new(GatedModel::open())).await;
    let response = rt
        .gateway()
        .ask(
            "client",
            ChatRequest::new("vacation days").with_session("does-not-exist"),
        )
        .await
        .unwrap();
    assert_ne!(response.session_id, "does-not-exist");
    rt.shutdown().await;
}

#[tokio::test]
async fn rate_limit_is_per_client() {
    let settings = Settings::from_yaml_str(
        r#"
rate_limit: { capacity: 2, refill_rate: 0.01 }
sweep_interval: 60
"#,
    )
    .unwrap();
    let rt = runtime_with(settings, handbook(), Arc::new(GatedModel::open())).await;
    let gateway = rt.gateway();

    for _ in 0..2 {
        gateway
            .ask("noisy", ChatRequest::new("vacation days"))
            .await
            .unwrap();
    }
    let err = gateway
        .ask("noisy", ChatRequest::new("vacation days"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimitExceeded { .. }));
    assert!(err.is_retryable());
    assert!(err.retry_after().unwrap() > Duration::ZERO);

    gateway
        .ask("quiet", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    rt.shutdown().await;
}

#[tokio::test]
async fn saturated_queue_pushes_back_on_new_questions() {
    let settings = Settings::from_yaml_str(
        r#"
queue: { max_concurrent: 1, max_size: 1, task_timeout: 30 }
sweep_interval: 60
"#,
    )
    .unwrap();
    let model = Arc::new(GatedModel::closed());
    let rt = Arc::new(runtime_with(settings, handbook(), model.clone()).await);

    let slow = {
        let rt = rt.clone();
        tokio::spawn(async move {
            rt.gateway()
                .ask("a", ChatRequest::new("parental leave"))
                .await
        })
    };
    eventually("first question generating", || {
        model.calls.load(Ordering::SeqCst) == 1
    })
    .await;

    let err = rt
        .gateway()
        .ask("b", ChatRequest::new("sick days"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueFull { capacity: 1 }));
    assert!(err.is_retryable());

    model.permits.add_permits(1);
    let answer = slow.await.unwrap().unwrap();
    assert_eq!(answer.answer, "parental leave (with 0 earlier messages)");
    assert_eq!(rt.stats().queue.rejected, 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn streaming_answer_records_the_session_before_it_ends() {
    let rt = runtime_with(base_settings(), handbook(), Arc::new(GatedModel::open())).await;
    let mut stream = rt
        .gateway()
        .ask_stream("client", ChatRequest::new("vacation days"))
        .await
        .unwrap();
    let session_id = stream.session_id().to_string();

    let mut text = String::new();
    let mut saw_end = false;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Fragment(f) => text.push_str(&f),
            StreamEvent::End => saw_end = true,
            StreamEvent::Error(e) => panic!("stream failed: {e}"),
        }
    }
    assert!(saw_end);
    assert_eq!(text, "vacation days (with 0 earlier messages)");
    assert_eq!(stream.sources().map(|s| s.len()), Some(2));

    let session = rt.gateway().sessions().get(&session_id).await.unwrap();
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.messages()[1].content(), text);
    rt.shutdown().await;
}

#[tokio::test]
async fn file_backed_sessions_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        "sessions: {{ ttl: 3600, backend: {{ kind: file, dir: '{}' }} }}\nsweep_interval: 60\n",
        dir.path().display()
    );

    let session_id = {
        let rt = runtime_with(
            Settings::from_yaml_str(&yaml).unwrap(),
            handbook(),
            Arc::new(GatedModel::open()),
        )
        .await;
        assert_eq!(rt.gateway().sessions().name(), "file");
        let response = rt
            .gateway()
            .ask("client", ChatRequest::new("vacation days"))
            .await
            .unwrap();
        rt.shutdown().await;
        response.session_id
    };

    let rt = runtime_with(
        Settings::from_yaml_str(&yaml).unwrap(),
        handbook(),
        Arc::new(GatedModel::open()),
    )
    .await;
    let follow_up = rt
        .gateway()
        .ask(
            "client",
            ChatRequest::new("and sick days?").with_session(session_id.clone()),
        )
        .await
        .unwrap();
    assert_eq!(follow_up.session_id, session_id);
    assert!(follow_up.answer.ends_with("(with 2 earlier messages)"));

    let listed = rt.gateway().sessions().list().await.unwrap();
    assert_eq!(listed.len(), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn environment_overrides_build_a_working_runtime() {
    let vars = [
        ("RAG_GATE_QUEUE_MAX_CONCURRENT", "3"),
        ("RAG_GATE_QUEUE_MAX_SIZE", "9"),
        ("RAG_GATE_SWEEP_INTERVAL_SECS", "15"),
    ];
    let settings = Settings::default()
        .with_overrides(|name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
        .unwrap();
    let rt = runtime_with(settings, handbook(), Arc::new(GatedModel::open())).await;

    let stats = rt.stats();
    assert_eq!(stats.queue.max_concurrent, 3);
    assert_eq!(stats.queue.max_size, 9);
    assert_eq!(rt.settings().sweep_interval, Some(Duration::from_secs(15)));
    rt.shutdown().await;
}
