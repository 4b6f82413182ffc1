//! 运行时模块：按配置一次性构建全部组件，运行后台清理任务，并负责显式关闭。
//!
//! # Runtime Module
//!
//! A [`Runtime`] owns every piece of shared state: the limiter, both caches,
//! the session store, the inference queue and the gateway over them. Nothing
//! lives in globals, so tests can build as many independent runtimes as they
//! like.
//!
//! ```rust,no_run
//! use rag_gate::config::Settings;
//! use rag_gate::runtime::Runtime;
//! # use std::sync::Arc;
//! # async fn demo(
//! #     retriever: Arc<dyn rag_gate::gateway::Retriever>,
//! #     generator: Arc<dyn rag_gate::gateway::Generator>,
//! # ) -> rag_gate::Result<()> {
//! let settings = Settings::from_env()?;
//! let runtime = Runtime::builder(settings)
//!     .retriever(retriever)
//!     .generator(generator)
//!     .build()
//!     .await?;
//! // ... serve requests through runtime.gateway() ...
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod maintenance;

pub use maintenance::{sweep, Maintenance, SweepReport};

use crate::cache::{AnswerCache, CacheStats, RetrievalCache};
use crate::config::Settings;
use crate::gateway::{Components, Gateway, Generator, Retriever};
use crate::queue::{InferenceQueue, QueueStats};
use crate::resilience::{RateLimiter, RateLimiterStats};
use crate::session::{build_session_store, SessionStore};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

/// Counters of every component at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub limiter: RateLimiterStats,
    pub retrieval_cache: CacheStats,
    pub answer_cache: CacheStats,
    pub queue: QueueStats,
}

pub struct RuntimeBuilder {
    settings: Settings,
    retriever: Option<Arc<dyn Retriever>>,
    generator: Option<Arc<dyn Generator>>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl RuntimeBuilder {
    pub fn retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Use this store instead of the backend named in the settings.
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(store);
        self
    }

    /// Validate the settings, construct every component and start the
    /// sweeper. Must be called inside a tokio runtime.
    pub async fn build(self) -> Result<Runtime> {
        let settings = self.settings;
        settings.validate()?;
        let missing = |what: &str| {
            Error::configuration_with_context(
                format!("no {} configured", what),
                ErrorContext::new()
                    .with_field_path(what)
                    .with_source("runtime_builder"),
            )
        };
        let retriever = self.retriever.ok_or_else(|| missing("retriever"))?;
        let generator = self.generator.ok_or_else(|| missing("generator"))?;
        let sweep_interval = settings
            .sweep_interval
            .ok_or_else(|| missing("sweep_interval"))?;

        let sessions = match self.sessions {
            Some(store) => store,
            None => build_session_store(&settings.sessions.backend, settings.sessions.ttl).await?,
        };
        let components = Components {
            limiter: Arc::new(RateLimiter::new(settings.rate_limit.clone())),
            retrieval_cache: Arc::new(RetrievalCache::new(
                "retrieval",
                settings.retrieval_cache.clone(),
            )),
            answer_cache: Arc::new(AnswerCache::new("answer", settings.answer_cache.clone())),
            sessions,
            queue: Arc::new(InferenceQueue::new(settings.queue.clone())?),
        };
        let gateway = Gateway::new(
            settings.gateway.clone(),
            &components,
            retriever,
            generator,
        );
        let maintenance = Maintenance::spawn(components.clone(), sweep_interval);
        info!(
            sessions = components.sessions.name(),
            max_concurrent = settings.queue.max_concurrent,
            "runtime ready"
        );
        Ok(Runtime {
            settings,
            components,
            gateway,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }
}

/// Explicitly owned admission state plus its background sweeper.
pub struct Runtime {
    settings: Settings,
    components: Components,
    gateway: Gateway,
    maintenance: Mutex<Option<Maintenance>>,
}

impl Runtime {
    pub fn builder(settings: Settings) -> RuntimeBuilder {
        RuntimeBuilder {
            settings,
            retriever: None,
            generator: None,
            sessions: None,
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            limiter: self.components.limiter.stats(),
            retrieval_cache: self.components.retrieval_cache.stats(),
            answer_cache: self.components.answer_cache.stats(),
            queue: self.components.queue.stats(),
        }
    }

    /// The indexed documents changed; cached searches are stale.
    pub fn documents_changed(&self) -> usize {
        self.gateway.invalidate_retrieval()
    }

    /// Run a sweep right away, independent of the schedule.
    pub async fn sweep_now(&self) -> SweepReport {
        sweep(&self.components).await
    }

    /// Stop the sweeper, then drain and stop the queue. Idempotent.
    pub async fn shutdown(&self) {
        let maintenance = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(maintenance) = maintenance {
            maintenance.stop().await;
        }
        self.components.queue.shutdown().await;
        info!("runtime shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("settings", &self.settings)
            .field("gateway", &self.gateway)
            .finish()
    }
}
