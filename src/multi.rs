//! Multi-build orchestration
//!
//! Each script gets its own executor, configuration and cancellation
//! token; the engine, pull coordinator and cancellation registry are
//! shared. Results are collected over a channel as builds finish. A
//! failing build does not stop its siblings.

use crate::build::{Globals, Interpreter};
use crate::engine::ContainerEngine;
use crate::error::{KilnError, KilnResult};
use crate::executor::Executor;
use crate::pull::PullCoordinator;
use crate::script::{BuildResult, Evaluator};
use crate::signal::CancellationRegistry;
use crate::ui::{BuildProgress, UiContext};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// One script to build
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub file_name: String,
    pub source: String,
    /// Directory `copy`, `import` and `save` resolve against
    pub build_dir: PathBuf,
    pub vars: HashMap<String, String>,
}

impl BuildPlan {
    /// Read a script from disk; its directory becomes the build directory
    pub async fn from_file(path: impl Into<PathBuf>, vars: HashMap<String, String>) -> KilnResult<Self> {
        let path = path.into();
        let source = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        let build_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(Self {
            file_name: path.display().to_string(),
            source,
            build_dir,
            vars,
        })
    }
}

/// Shared collaborators for a set of builds
#[derive(Clone)]
pub struct Builder {
    engine: Arc<dyn ContainerEngine>,
    pulls: Arc<PullCoordinator>,
    signals: Arc<CancellationRegistry>,
    globals: Globals,
    ui: UiContext,
}

impl Builder {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        signals: Arc<CancellationRegistry>,
        globals: Globals,
        ui: UiContext,
    ) -> Self {
        Self {
            engine,
            pulls: PullCoordinator::new(),
            signals,
            globals,
            ui,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    pub fn ui(&self) -> &UiContext {
        &self.ui
    }

    /// An evaluator with its own executor and a child cancellation token
    pub fn evaluator(&self, plan: &BuildPlan, ui: UiContext) -> Evaluator {
        let globals = Globals {
            cancel: self.globals.cancel.child_token(),
            ..self.globals.clone()
        };
        let cancel = globals.cancel.clone();
        let hook = self.signals.track_func(move || cancel.cancel());

        let exec = Executor::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.pulls),
            Arc::clone(&self.signals),
            &globals,
            ui,
        );
        let interp = Interpreter::new(exec, plan.vars.clone(), plan.build_dir.clone());
        Evaluator::new(interp, &globals, plan.file_name.clone()).with_cancel_hook(hook)
    }

    /// Run one script to completion
    pub async fn build(&self, plan: &BuildPlan) -> BuildResult {
        let _runner = self.signals.add_runner();
        let mut evaluator = self.evaluator(plan, self.ui.clone());
        evaluator.run_script(&plan.source).await
    }

    /// Run every plan concurrently and wait for all of them
    ///
    /// Results come back in completion order; see `check` for the
    /// aggregate outcome.
    pub async fn build_all(&self, plans: Vec<BuildPlan>) -> Vec<BuildResult> {
        let progress = BuildProgress::new(&self.ui);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        let names: Vec<String> = plans.iter().map(|p| p.file_name.clone()).collect();

        for plan in plans {
            let bar = progress.add(&plan.file_name);
            let builder = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let _runner = builder.signals.add_runner();
                let ui = builder.ui.clone().with_bar(bar.clone());
                let mut evaluator = builder.evaluator(&plan, ui);
                let result = evaluator.run_script(&plan.source).await;
                let _ = tx.send((result, bar));
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(names.len());
        while let Some((result, bar)) = rx.recv().await {
            let message = match &result.outcome {
                Ok(id) => id.clone(),
                Err(e) => e.to_string(),
            };
            progress.finish(&bar, result.is_ok(), &message);
            debug!("Build of {} finished", result.file_name);
            results.push(result);
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Build task ended abnormally: {}", e);
            }
        }

        // A task that panicked never reported; attribute it by name
        for name in names {
            if !results.iter().any(|r| r.file_name == name) {
                results.push(BuildResult {
                    file_name: name,
                    outcome: Err(KilnError::Internal("build task did not finish".to_string())),
                });
            }
        }
        results
    }
}

/// Fail with the names of every build that failed
pub fn check(results: &[BuildResult]) -> KilnResult<()> {
    let failed: Vec<String> = results
        .iter()
        .filter(|r| !r.is_ok())
        .map(|r| r.file_name.clone())
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(KilnError::BuildsFailed { failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryEngine;
    use std::time::Duration;
    use tempfile::TempDir;

    fn builder(engine: Arc<MemoryEngine>) -> Builder {
        Builder::new(
            engine,
            CancellationRegistry::new(),
            Globals::default(),
            UiContext::non_interactive().with_quiet(true),
        )
    }

    fn plan(dir: &TempDir, name: &str, source: &str) -> BuildPlan {
        BuildPlan {
            file_name: name.to_string(),
            source: source.to_string(),
            build_dir: dir.path().to_path_buf(),
            vars: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn all_builds_succeed() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let results = builder(engine)
            .build_all(vec![
                plan(&temp, "a.kiln", "from \"debian\"\nrun \"a\"\n"),
                plan(&temp, "b.kiln", "from \"debian\"\nrun \"b\"\n"),
            ])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(BuildResult::is_ok));
        check(&results).unwrap();
    }

    #[tokio::test]
    async fn failures_are_attributed_and_siblings_finish() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new().fail_on("broken"));
        let results = builder(engine.clone())
            .build_all(vec![
                plan(&temp, "good.kiln", "from \"debian\"\nrun \"slow\"\nrun \"fine\"\n"),
                plan(&temp, "bad.kiln", "from \"debian\"\nrun \"broken\"\n"),
            ])
            .await;

        let Err(KilnError::BuildsFailed { failed }) = check(&results) else {
            panic!("expected BuildsFailed");
        };
        assert_eq!(failed, ["bad.kiln"]);
        let good = results.iter().find(|r| r.file_name == "good.kiln").unwrap();
        assert!(good.is_ok());
        assert_eq!(engine.live_containers(), 0);
    }

    #[tokio::test]
    async fn concurrent_builds_share_one_pull() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new().with_pull_delay(Duration::from_millis(50)));
        let results = builder(engine.clone())
            .build_all(vec![
                plan(&temp, "a.kiln", "from \"alpine\"\nrun \"a\"\n"),
                plan(&temp, "b.kiln", "from \"alpine\"\nrun \"b\"\n"),
                plan(&temp, "c.kiln", "from \"alpine\"\nrun \"c\"\n"),
            ])
            .await;
        check(&results).unwrap();
        assert_eq!(engine.pulls(), 1);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_every_build() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let b = builder(engine);
        b.globals().cancel.cancel();
        let results = b
            .build_all(vec![plan(&temp, "a.kiln", "from \"debian\"\n")])
            .await;
        assert!(check(&results).is_err());
        assert!(results[0].outcome.as_ref().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn finished_builds_unregister_their_cancel_hooks() {
        let temp = TempDir::new().unwrap();
        let b = builder(Arc::new(MemoryEngine::new()));

        let evaluator = b.evaluator(&plan(&temp, "a.kiln", ""), b.ui().clone());
        assert_eq!(b.signals.func_count(), 1);
        drop(evaluator);
        assert_eq!(b.signals.func_count(), 0);

        for name in ["a.kiln", "b.kiln", "c.kiln"] {
            let result = b.build(&plan(&temp, name, "from \"debian\"\n")).await;
            assert!(result.is_ok());
        }
        let results = b
            .build_all(vec![plan(&temp, "d.kiln", "from \"debian\"\n")])
            .await;
        check(&results).unwrap();
        assert_eq!(b.signals.func_count(), 0);
    }

    #[tokio::test]
    async fn plan_from_file_uses_its_directory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("web.kiln");
        std::fs::write(&path, "from \"debian\"\n").unwrap();
        let plan = BuildPlan::from_file(&path, HashMap::new()).await.unwrap();
        assert_eq!(plan.build_dir, temp.path());
        assert_eq!(plan.source, "from \"debian\"\n");
    }
}
