//! rag-gate-sim: 准入层负载模拟器：合成检索器与生成器，多客户端并发请求并打印统计
//!
//! Usage:
//!   rag-gate-sim [--config <file>] [--clients <n>] [--requests <n>]
//!                [--latency-ms <ms>] [--questions <n>] [--stream]
//!
//! Without `--config`, settings come from `RAG_GATE_*` environment variables.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rag_gate::gateway::GenerationRequest;
use rag_gate::{
    BoxError, ChatRequest, Error, Generator, Retriever, Runtime, ScoredChunk, Settings,
    StreamEvent,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    clients: usize,
    requests: usize,
    latency: Duration,
    questions: usize,
    stream: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: None,
            clients: 8,
            requests: 5,
            latency: Duration::from_millis(200),
            questions: 4,
            stream: false,
        }
    }
}

fn print_usage() {
    println!(
        r#"rag-gate-sim: admission layer load simulator

USAGE:
    rag-gate-sim [OPTIONS]

OPTIONS:
    --config <file>       YAML settings file (default: RAG_GATE_* environment)
    --clients <n>         Concurrent clients, each with its own key [default: 8]
    --requests <n>        Requests per client [default: 5]
    --latency-ms <ms>     Synthetic generation latency [default: 200]
    --questions <n>       Distinct questions in the pool [default: 4]
    --stream              Use streaming answers
    --help                Show this help message

ENVIRONMENT:
    RUST_LOG              Log filter (default: info)"#
    );
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Options>> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--config" => opts.config = Some(PathBuf::from(value("--config")?)),
            "--clients" => opts.clients = value("--clients")?.parse().context("--clients")?,
            "--requests" => opts.requests = value("--requests")?.parse().context("--requests")?,
            "--latency-ms" => {
                let ms: u64 = value("--latency-ms")?.parse().context("--latency-ms")?;
                opts.latency = Duration::from_millis(ms);
            }
            "--questions" => {
                opts.questions = value("--questions")?.parse().context("--questions")?
            }
            "--stream" => opts.stream = true,
            "--help" | "-h" => return Ok(None),
            other => bail!("unknown option: {other}"),
        }
    }
    if opts.questions == 0 {
        bail!("--questions must be at least 1");
    }
    Ok(Some(opts))
}

/// Returns three fixed chunks per query after a short delay.
struct SyntheticRetriever;

#[async_trait]
impl Retriever for SyntheticRetriever {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, BoxError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok((0..k.min(3))
            .map(|i| {
                ScoredChunk::new(
                    format!("Passage {i} relevant to '{query}'."),
                    format!("handbook-{i}.pdf"),
                    1.0 - i as f32 * 0.1,
                )
                .with_page(i as u32 + 1)
            })
            .collect())
    }
}

/// Sleeps for the configured latency, then answers word by word.
struct SyntheticGenerator {
    latency: Duration,
}

impl SyntheticGenerator {
    fn answer_for(request: &GenerationRequest) -> String {
        format!(
            "Based on {} passages and {} earlier messages: see the handbook about '{}'.",
            request.context.len(),
            request.history.len(),
            request.question
        )
    }
}

#[async_trait]
impl Generator for SyntheticGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<String, BoxError> {
        tokio::time::sleep(self.latency).await;
        Ok(Self::answer_for(&request))
    }

    async fn generate_stream(
        &self,
        request: GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String, BoxError>>, BoxError> {
        let answer = Self::answer_for(&request);
        let words: Vec<String> = answer.split(' ').map(|w| format!("{w} ")).collect();
        let per_word = self.latency / words.len().max(1) as u32;
        Ok(futures::stream::iter(words)
            .then(move |word| async move {
                tokio::time::sleep(per_word).await;
                Ok(word)
            })
            .boxed())
    }
}

async fn run_client(
    runtime: Arc<Runtime>,
    client: usize,
    opts: Arc<Options>,
) -> BTreeMap<&'static str, usize> {
    let key = format!("client-{client}");
    let mut outcomes = BTreeMap::new();
    let mut session: Option<String> = None;
    for n in 0..opts.requests {
        let question = format!("question {}", (client + n) % opts.questions);
        let mut request = ChatRequest::new(question);
        // every other client keeps a conversation going
        if client % 2 == 1 {
            if let Some(id) = &session {
                request = request.with_session(id.clone());
            }
        }

        let outcome = if opts.stream {
            match runtime.gateway().ask_stream(&key, request).await {
                Ok(mut stream) => {
                    session = Some(stream.session_id().to_string());
                    let mut label = "stream_incomplete";
                    while let Some(event) = stream.next().await {
                        match event {
                            StreamEvent::Fragment(_) => {}
                            StreamEvent::End => label = "ok",
                            StreamEvent::Error(e) => label = outcome_label(&e),
                        }
                    }
                    label
                }
                Err(e) => outcome_label(&e),
            }
        } else {
            match runtime.gateway().ask(&key, request).await {
                Ok(response) => {
                    session = Some(response.session_id);
                    if response.cached {
                        "cached"
                    } else {
                        "ok"
                    }
                }
                Err(e) => outcome_label(&e),
            }
        };
        *outcomes.entry(outcome).or_insert(0) += 1;
    }
    outcomes
}

fn outcome_label(error: &Error) -> &'static str {
    match error {
        Error::RateLimitExceeded { .. } => "rate_limited",
        Error::QueueFull { .. } => "queue_full",
        Error::QueueTimeout { .. } => "timed_out",
        Error::Cancelled { .. } => "cancelled",
        Error::QueueClosed => "closed",
        other => {
            warn!(error = %other, "request failed");
            "failed"
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(opts) = parse_args(&args)? else {
        print_usage();
        return Ok(());
    };
    rag_gate::logging::init("info")?;

    let mut settings = match &opts.config {
        Some(path) => Settings::from_yaml_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::from_env().context("reading RAG_GATE_* environment")?,
    };
    if settings.sweep_interval.is_none() {
        info!(
            interval_secs = DEFAULT_SWEEP_INTERVAL.as_secs(),
            "no sweep interval configured, using simulator default"
        );
        settings = settings.with_sweep_interval(DEFAULT_SWEEP_INTERVAL);
    }

    let runtime = Arc::new(
        Runtime::builder(settings)
            .retriever(Arc::new(SyntheticRetriever))
            .generator(Arc::new(SyntheticGenerator {
                latency: opts.latency,
            }))
            .build()
            .await?,
    );
    info!(
        clients = opts.clients,
        requests = opts.requests,
        stream = opts.stream,
        "starting simulation"
    );

    let opts = Arc::new(opts);
    let started = tokio::time::Instant::now();
    let clients: Vec<_> = (0..opts.clients)
        .map(|client| tokio::spawn(run_client(runtime.clone(), client, opts.clone())))
        .collect();

    let mut totals: BTreeMap<&'static str, usize> = BTreeMap::new();
    for joined in futures::future::join_all(clients).await {
        for (outcome, n) in joined.context("client task panicked")? {
            *totals.entry(outcome).or_insert(0) += n;
        }
    }
    let elapsed = started.elapsed();

    let report = runtime.sweep_now().await;
    println!("=== Outcomes ({:.2?}) ===", elapsed);
    for (outcome, n) in &totals {
        println!("  {outcome:<18} {n}");
    }
    println!("\n=== Final sweep ===");
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("\n=== Component statistics ===");
    println!("{}", serde_json::to_string_pretty(&runtime.stats())?);

    runtime.shutdown().await;
    Ok(())
}
