//! Event post-processors
//!
//! An engine receives a uniform event (faceCapture, FaceDetection, ...) and
//! may return derived events (faceRecognized, ...). Engines never publish;
//! the supervisor publishes derivations to keep topic layout in one place.
//!
//! `EngineManager` owns the ordered, enabled subset and dispatches each event
//! through all of them with a per-engine timeout. A panicking or failing
//! engine yields no derivations but never breaks the dispatch loop.

pub mod plate;
pub mod recognize;

use crate::error::Result;
use crate::model::AnalyticEvent;
use crate::state::env_duration_secs;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Default per-engine processing deadline
const DEFAULT_ENGINE_TIMEOUT: Duration = Duration::from_secs(10);

/// Post-processor contract
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;
    fn enabled(&self) -> bool;

    /// Process one event. Returns derived events (possibly none).
    async fn process(&self, event: AnalyticEvent) -> Result<Vec<AnalyticEvent>>;
}

/// Ordered set of enabled engines
pub struct EngineManager {
    engines: Vec<Arc<dyn Engine>>,
    per_engine_timeout: Duration,
}

impl EngineManager {
    /// Keeps only enabled engines; a non-positive timeout becomes the default.
    pub fn new(engines: Vec<Arc<dyn Engine>>, per_engine_timeout: Duration) -> Self {
        let per_engine_timeout = if per_engine_timeout.is_zero() {
            DEFAULT_ENGINE_TIMEOUT
        } else {
            per_engine_timeout
        };
        let engines = engines.into_iter().filter(|e| e.enabled()).collect();
        Self {
            engines,
            per_engine_timeout,
        }
    }

    /// Load the engine set from `ENGINES` (csv) and `ENGINE_TIMEOUT_SECONDS`.
    /// Unknown tokens are logged and ignored.
    pub fn from_env() -> Self {
        let names: Vec<String> = std::env::var("ENGINES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let timeout = env_duration_secs("ENGINE_TIMEOUT_SECONDS", 10);

        let mut engines: Vec<Arc<dyn Engine>> = Vec::new();
        for name in &names {
            match name.to_lowercase().as_str() {
                "findface" | "recognize" => {
                    if let Some(engine) = recognize::FaceRecognizeEngine::from_env() {
                        engines.push(Arc::new(engine));
                    }
                }
                "plater" | "plate" | "lpr" => {
                    engines.push(Arc::new(plate::PlateStub));
                }
                other => {
                    tracing::warn!(engine = %other, "unknown engine token, ignoring");
                }
            }
        }

        let manager = Self::new(engines, timeout);
        if manager.is_enabled() {
            tracing::info!(engines = %manager.names().join(","), "engines enabled");
        } else {
            tracing::info!("no engines enabled");
        }
        manager
    }

    pub fn is_enabled(&self) -> bool {
        !self.engines.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.engines
            .iter()
            .any(|e| e.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Run every engine in order; concatenate their derivations. Each engine
    /// call runs on its own task under the configured timeout, so a panic or
    /// a hang is isolated to that engine.
    pub async fn process_all(&self, event: &AnalyticEvent) -> Vec<AnalyticEvent> {
        let mut derived = Vec::new();
        for engine in &self.engines {
            let engine_clone = engine.clone();
            let event_clone = event.clone();
            let mut task = tokio::spawn(async move { engine_clone.process(event_clone).await });

            match tokio::time::timeout(self.per_engine_timeout, &mut task).await {
                Ok(Ok(Ok(events))) => derived.extend(events),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(engine = %engine.name(), error = %e, "engine error");
                }
                Ok(Err(join_error)) => {
                    if join_error.is_panic() {
                        tracing::error!(engine = %engine.name(), "engine panicked");
                    } else {
                        tracing::warn!(engine = %engine.name(), "engine task cancelled");
                    }
                }
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        engine = %engine.name(),
                        timeout_secs = self.per_engine_timeout.as_secs(),
                        "engine timed out"
                    );
                }
            }
        }
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEngine {
        name: &'static str,
        enabled: bool,
        output: Vec<AnalyticEvent>,
    }

    #[async_trait]
    impl Engine for FixedEngine {
        fn name(&self) -> &str {
            self.name
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        async fn process(&self, _event: AnalyticEvent) -> Result<Vec<AnalyticEvent>> {
            Ok(self.output.clone())
        }
    }

    struct PanickingEngine;

    #[async_trait]
    impl Engine for PanickingEngine {
        fn name(&self) -> &str {
            "boom"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn process(&self, _event: AnalyticEvent) -> Result<Vec<AnalyticEvent>> {
            panic!("engine bug");
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl Engine for SlowEngine {
        fn name(&self) -> &str {
            "slow"
        }
        fn enabled(&self) -> bool {
            true
        }
        async fn process(&self, _event: AnalyticEvent) -> Result<Vec<AnalyticEvent>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    fn derived(analytic: &str) -> AnalyticEvent {
        AnalyticEvent {
            analytic_type: analytic.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_engines_filtered() {
        let manager = EngineManager::new(
            vec![
                Arc::new(FixedEngine {
                    name: "on",
                    enabled: true,
                    output: vec![],
                }),
                Arc::new(FixedEngine {
                    name: "off",
                    enabled: false,
                    output: vec![],
                }),
            ],
            Duration::from_secs(1),
        );
        assert_eq!(manager.names(), vec!["on"]);
        assert!(manager.has("ON"));
        assert!(!manager.has("off"));
    }

    #[tokio::test]
    async fn test_process_all_concatenates_in_order() {
        let manager = EngineManager::new(
            vec![
                Arc::new(FixedEngine {
                    name: "a",
                    enabled: true,
                    output: vec![derived("first")],
                }),
                Arc::new(FixedEngine {
                    name: "b",
                    enabled: true,
                    output: vec![derived("second")],
                }),
            ],
            Duration::from_secs(1),
        );
        let out = manager.process_all(&AnalyticEvent::default()).await;
        let types: Vec<&str> = out.iter().map(|e| e.analytic_type.as_str()).collect();
        assert_eq!(types, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_panicking_engine_is_isolated() {
        let manager = EngineManager::new(
            vec![
                Arc::new(PanickingEngine),
                Arc::new(FixedEngine {
                    name: "after",
                    enabled: true,
                    output: vec![derived("survived")],
                }),
            ],
            Duration::from_secs(1),
        );
        let out = manager.process_all(&AnalyticEvent::default()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].analytic_type, "survived");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_engine_times_out() {
        let manager = EngineManager::new(
            vec![
                Arc::new(SlowEngine),
                Arc::new(FixedEngine {
                    name: "after",
                    enabled: true,
                    output: vec![derived("survived")],
                }),
            ],
            Duration::from_secs(1),
        );
        let out = manager.process_all(&AnalyticEvent::default()).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].analytic_type, "survived");
    }
}
