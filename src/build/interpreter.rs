//! Verb and func semantics
//!
//! The evaluator decides whether a verb runs at all (cache check, omit list);
//! the interpreter does the work once it does. Verbs that change the image
//! end in a commit annotated with the current cache key.

use super::cache_key::copy_key;
use super::copy;
use crate::error::{KilnError, KilnResult};
use crate::executor::{Executor, Hook};
use crate::store::archive::ArchiveFormat;
use std::collections::HashMap;
use std::mem;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const RUN_SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// A scoped override requested by a block verb
#[derive(Debug, Clone)]
pub enum Scope {
    /// `with_user NAME`
    User(String),
    /// `inside PATH`
    Inside(String),
    /// `skip`
    Skip,
}

/// What an override replaced; hand it back to `leave_scope`
#[derive(Debug)]
#[must_use]
pub enum SavedScope {
    User(String),
    Workdir(String),
    Skip(bool),
}

/// Parsed arguments of the `save` func
#[derive(Debug, Clone, Default)]
pub struct SaveRequest {
    pub tag: Option<String>,
    pub file: Option<String>,
    pub kind: Option<String>,
}

pub struct Interpreter {
    exec: Executor,
    vars: HashMap<String, String>,
    build_dir: PathBuf,
    /// Annotation for the next commit; empty disables the cache check
    cache_key: String,
}

impl Interpreter {
    pub fn new(exec: Executor, vars: HashMap<String, String>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            exec,
            vars,
            build_dir: build_dir.into(),
            cache_key: String::new(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.exec
    }

    pub fn executor_mut(&mut self) -> &mut Executor {
        &mut self.exec
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn set_cache_key(&mut self, key: impl Into<String>) {
        self.cache_key = key.into();
    }

    pub fn image_id(&self) -> &str {
        self.exec.image_id()
    }

    fn has_image(&self) -> KilnResult<()> {
        if self.exec.image_id().is_empty() {
            return Err(KilnError::NoImage);
        }
        Ok(())
    }

    async fn make_layer(&mut self, use_hook: bool) -> KilnResult<()> {
        let key = self.cache_key.clone();
        let hook = use_hook.then_some(Hook::Run);
        self.exec.commit(&key, hook).await
    }

    /// `from IMAGE`
    pub async fn from(&mut self, image: &str) -> KilnResult<()> {
        let id = if image.is_empty() || image == "scratch" {
            self.exec.from_scratch().await?
        } else {
            self.exec.fetch(image).await?
        };
        info!("Base image {} is {}", image, id);
        Ok(())
    }

    /// `run CMD`; `output = false` hides the command's output
    pub async fn run(&mut self, command: &str, output: bool) -> KilnResult<()> {
        self.exec.config_mut().temporary_command(
            RUN_SHELL.iter().map(|s| s.to_string()).collect(),
            vec![command.to_string()],
        );
        let show_run = self.exec.show_run();
        if show_run && !output {
            self.exec.set_show_run(false);
        }

        let result = self.make_layer(true).await;

        self.exec.set_show_run(show_run);
        self.exec.config_mut().clear_temporary_command();
        result
    }

    /// `debug [SHELL]`: an interactive shell whose result is committed
    pub async fn debug(&mut self, shell: &str) -> KilnResult<()> {
        self.has_image()?;
        self.exec.set_stdin(true);
        self.exec
            .config_mut()
            .temporary_command(Vec::new(), vec![shell.to_string()]);

        let result = self.make_layer(true).await;

        self.exec.set_stdin(false);
        self.exec.config_mut().clear_temporary_command();
        result
    }

    /// `copy SRC, DST`
    pub async fn copy(
        &mut self,
        source: &str,
        target: &str,
        mut ignore: Vec<String>,
        ignore_file: Option<&str>,
    ) -> KilnResult<()> {
        self.has_image()?;

        if let Some(file) = ignore_file {
            ignore.extend(copy::read_ignore_file(&self.build_dir.join(file))?);
        }
        ignore.extend(copy::dockerignore(&self.build_dir)?);

        let workdir = self.exec.config().workdir.effective().to_string();
        let (source, target) = copy::resolve_paths(&self.build_dir, source, target, &workdir)?;
        debug!("Copying {} to {}", source, target);

        let build_dir = self.build_dir.clone();
        let archive = tokio::task::spawn_blocking(move || {
            copy::archive(&build_dir, &source, &target, &ignore)
        })
        .await
        .map_err(|e| KilnError::Internal(format!("copy archive task failed: {}", e)))??;
        let _tracked = self.exec.signals().track_file(archive.path());

        let key = copy_key(&archive.sum);
        if self.exec.check_cache(&key).await? {
            return Ok(());
        }

        self.exec
            .commit(&key, Some(Hook::CopyArchive(archive.path().to_path_buf())))
            .await
    }

    /// `workdir PATH`
    pub async fn workdir(&mut self, dir: &str) -> KilnResult<()> {
        self.has_image()?;
        if !Path::new(dir).is_absolute() {
            return Err(KilnError::script(
                "workdir",
                format!("path {:?} is not absolute in workdir", dir),
            ));
        }
        self.exec.config_mut().workdir.image = dir.to_string();
        self.make_layer(false).await
    }

    /// `user NAME`
    pub async fn user(&mut self, name: &str) -> KilnResult<()> {
        self.has_image()?;
        self.exec.config_mut().user.image = name.to_string();
        self.make_layer(false).await
    }

    /// `cmd ARGS...`
    pub async fn cmd(&mut self, args: Vec<String>) -> KilnResult<()> {
        self.has_image()?;
        self.exec.config_mut().cmd.image = args;
        self.make_layer(false).await
    }

    /// `entrypoint ARGS...`
    pub async fn entrypoint(&mut self, args: Vec<String>) -> KilnResult<()> {
        self.has_image()?;
        self.exec.config_mut().entrypoint.image = args;
        self.make_layer(false).await
    }

    /// `env K: V, ...`
    pub async fn env(&mut self, pairs: &[(String, String)]) -> KilnResult<()> {
        self.has_image()?;
        self.exec
            .config_mut()
            .merge_env(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.make_layer(false).await
    }

    /// `label K: V, ...`
    pub async fn label(&mut self, pairs: &[(String, String)]) -> KilnResult<()> {
        self.has_image()?;
        let labels = &mut self.exec.config_mut().labels;
        for (key, value) in pairs {
            labels.insert(key.clone(), value.clone());
        }
        self.make_layer(false).await
    }

    /// `set_exec cmd: [...], entrypoint: [...]`
    pub async fn set_exec(&mut self, targets: &[(String, Vec<String>)]) -> KilnResult<()> {
        self.has_image()?;
        if let Some((key, _)) = targets
            .iter()
            .find(|(key, _)| key != "cmd" && key != "entrypoint")
        {
            return Err(KilnError::script(
                "set_exec",
                format!("set_exec only accepts cmd and entrypoint as keys, not {:?}", key),
            ));
        }

        let config = self.exec.config_mut();
        for (key, values) in targets {
            if key == "cmd" {
                config.cmd.image = values.clone();
            } else {
                config.entrypoint.image = values.clone();
            }
        }
        self.make_layer(false).await
    }

    /// `flatten`
    pub async fn flatten(&mut self) -> KilnResult<()> {
        self.has_image()?;
        self.exec.flatten().await
    }

    /// `tag NAME`
    pub async fn tag(&mut self, name: &str) -> KilnResult<()> {
        self.has_image()?;
        self.exec.commit("", None).await?;
        self.exec.tag(name).await
    }

    /// Install a scoped override; undo it with `leave_scope` on every exit
    pub fn enter_scope(&mut self, scope: Scope) -> KilnResult<SavedScope> {
        match scope {
            Scope::User(name) => {
                self.has_image()?;
                let config = self.exec.config_mut();
                Ok(SavedScope::User(mem::replace(&mut config.user.temporary, name)))
            }
            Scope::Inside(path) => {
                self.has_image()?;
                let dir = self.inside_dir(&path)?;
                let config = self.exec.config_mut();
                Ok(SavedScope::Workdir(mem::replace(&mut config.workdir.temporary, dir)))
            }
            Scope::Skip => {
                let ledger = self.exec.ledger_mut();
                let previous = ledger.skip_mode();
                ledger.set_skip_mode(true);
                Ok(SavedScope::Skip(previous))
            }
        }
    }

    pub fn leave_scope(&mut self, saved: SavedScope) {
        match saved {
            SavedScope::User(previous) => self.exec.config_mut().user.temporary = previous,
            SavedScope::Workdir(previous) => self.exec.config_mut().workdir.temporary = previous,
            SavedScope::Skip(previous) => self.exec.ledger_mut().set_skip_mode(previous),
        }
    }

    fn inside_dir(&self, path: &str) -> KilnResult<String> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            let current = self.exec.config().workdir.effective();
            if current.is_empty() {
                PathBuf::from(path)
            } else {
                Path::new(current).join(path)
            }
        };

        let cleaned = copy::clean_path(&joined);
        if !cleaned.is_absolute() {
            return Err(KilnError::script(
                "inside",
                format!("path {:?} is not absolute in workdir", path),
            ));
        }
        Ok(cleaned.to_string_lossy().into_owned())
    }

    /// `var KEY`
    pub fn var(&self, key: &str) -> KilnResult<String> {
        self.vars
            .get(key)
            .cloned()
            .ok_or_else(|| KilnError::VarMissing(key.to_string()))
    }

    /// `getenv NAME`; empty when unset
    pub fn getenv(&self, name: &str) -> String {
        std::env::var(name).unwrap_or_default()
    }

    /// `read PATH`
    pub async fn read(&self, path: &str) -> KilnResult<String> {
        self.has_image()?;
        let content = self.exec.copy_one_file_from_container(path).await?;
        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// `getuid NAME`
    pub async fn getuid(&self, name: &str) -> KilnResult<String> {
        self.lookup_id("getuid", name, "/etc/passwd", "user").await
    }

    /// `getgid NAME`
    pub async fn getgid(&self, name: &str) -> KilnResult<String> {
        self.lookup_id("getgid", name, "/etc/group", "group").await
    }

    async fn lookup_id(&self, func: &str, name: &str, file: &str, kind: &str) -> KilnResult<String> {
        let content = self.read(file).await?;
        field_for(&content, name)
            .ok_or_else(|| KilnError::script(func, format!("could not find {} {:?}", kind, name)))
    }

    /// `save tag: T, file: F, kind: K`
    pub async fn save(&mut self, request: SaveRequest) -> KilnResult<()> {
        self.has_image()?;

        if let Some(tag) = &request.tag {
            self.exec.tag(tag).await?;
        }

        let Some(file) = &request.file else {
            return Ok(());
        };

        let format: ArchiveFormat = request.kind.as_deref().unwrap_or("").parse()?;
        let tag = match &request.tag {
            Some(tag) => tag.clone(),
            None => Path::new(file)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        let path = self.build_dir.join(file);
        self.exec.save(&path, format, &[tag]).await
    }

    /// Produce the final image, rebuilt without skipped layers
    pub async fn make_image(&mut self) -> KilnResult<String> {
        self.exec.make_image().await
    }
}

/// Third `:`-separated field of the line whose first field is `name`
fn field_for(content: &str, name: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }
        fields.nth(1).map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::cache_key::verb_key;
    use crate::build::Globals;
    use crate::engine::{ContainerEngine, MemoryEngine};
    use crate::pull::PullCoordinator;
    use crate::signal::CancellationRegistry;
    use crate::ui::UiContext;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn interpreter(engine: Arc<MemoryEngine>, build_dir: &Path) -> Interpreter {
        let exec = Executor::new(
            engine,
            PullCoordinator::new(),
            CancellationRegistry::new(),
            &Globals::default(),
            UiContext::non_interactive().with_quiet(true),
        );
        let vars = HashMap::from([("version".to_string(), "1.2".to_string())]);
        Interpreter::new(exec, vars, build_dir)
    }

    async fn started(engine: Arc<MemoryEngine>, build_dir: &Path) -> Interpreter {
        let mut interp = interpreter(engine, build_dir);
        interp.from("debian").await.unwrap();
        interp
    }

    #[test]
    fn passwd_fields() {
        let passwd = "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534::/:/bin/false\n";
        assert_eq!(field_for(passwd, "nobody").as_deref(), Some("65534"));
        assert_eq!(field_for(passwd, "root").as_deref(), Some("0"));
        assert_eq!(field_for(passwd, "missing"), None);
    }

    #[tokio::test]
    async fn verbs_need_an_image() {
        let temp = TempDir::new().unwrap();
        let mut interp = interpreter(Arc::new(MemoryEngine::new()), temp.path());
        assert!(matches!(interp.user("app").await, Err(KilnError::NoImage)));
        assert!(matches!(
            interp.enter_scope(Scope::User("app".into())),
            Err(KilnError::NoImage)
        ));
    }

    #[tokio::test]
    async fn workdir_must_be_absolute() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        let err = interp.workdir("relative").await.unwrap_err();
        assert!(err.to_string().contains("is not absolute in workdir"));

        interp.workdir("/srv").await.unwrap();
        assert_eq!(interp.executor().config().workdir.effective(), "/srv");
    }

    #[tokio::test]
    async fn run_failure_leaves_image() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new().fail_on("broken"));
        let mut interp = started(engine, temp.path()).await;
        let before = interp.image_id().to_string();

        assert!(interp.run("broken build", true).await.is_err());
        assert_eq!(interp.image_id(), before);
        assert!(!interp.executor().config().has_temporaries());
    }

    #[tokio::test]
    async fn scopes_restore_previous_values() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        interp.workdir("/srv").await.unwrap();

        let outer = interp.enter_scope(Scope::Inside("app".into())).unwrap();
        assert_eq!(interp.executor().config().workdir.effective(), "/srv/app");
        let inner = interp.enter_scope(Scope::Inside("../lib".into())).unwrap();
        assert_eq!(interp.executor().config().workdir.effective(), "/srv/lib");

        interp.leave_scope(inner);
        assert_eq!(interp.executor().config().workdir.effective(), "/srv/app");
        interp.leave_scope(outer);
        assert!(interp.executor().config().workdir.temporary.is_empty());

        let user = interp.enter_scope(Scope::User("nobody".into())).unwrap();
        assert_eq!(interp.executor().config().user.effective(), "nobody");
        interp.leave_scope(user);
        assert_eq!(interp.executor().config().user.effective(), "");
    }

    #[tokio::test]
    async fn inside_rejects_escaping_root() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        interp.executor_mut().config_mut().workdir.image = String::new();
        let err = interp.enter_scope(Scope::Inside("rel".into())).unwrap_err();
        assert!(err.to_string().contains("not absolute"));
    }

    #[tokio::test]
    async fn env_merges_sorted() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        interp
            .env(&[("B".into(), "2".into()), ("A".into(), "1".into())])
            .await
            .unwrap();
        interp.env(&[("B".into(), "3".into())]).await.unwrap();
        assert_eq!(interp.executor().config().env, ["A=1", "B=3"]);
    }

    #[tokio::test]
    async fn set_exec_rejects_other_keys() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        let err = interp
            .set_exec(&[("cmd".into(), vec!["a".into()]), ("user".into(), vec![])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only accepts cmd and entrypoint"));
        assert_eq!(interp.executor().config().cmd.effective(), ["/bin/sh"]);

        interp
            .set_exec(&[("entrypoint".into(), vec!["/init".into()])])
            .await
            .unwrap();
        assert_eq!(interp.executor().config().entrypoint.effective(), ["/init"]);
    }

    #[tokio::test]
    async fn copy_is_cached_by_content() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("app.conf"), "port = 80\n").unwrap();
        let engine = Arc::new(MemoryEngine::new());

        let mut first = started(engine.clone(), temp.path()).await;
        first.copy("app.conf", "/etc/", Vec::new(), None).await.unwrap();
        let files = engine.image_files(first.image_id()).unwrap();
        assert_eq!(files["/etc/app.conf"], b"port = 80\n");

        let mut second = started(engine.clone(), temp.path()).await;
        second.copy("app.conf", "/etc/", Vec::new(), None).await.unwrap();
        assert_eq!(second.image_id(), first.image_id());

        fs::write(temp.path().join("app.conf"), "port = 81\n").unwrap();
        let mut third = started(engine.clone(), temp.path()).await;
        third.copy("app.conf", "/etc/", Vec::new(), None).await.unwrap();
        assert_ne!(third.image_id(), first.image_id());
    }

    #[tokio::test]
    async fn cancel_during_copy_removes_container_and_archive() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("app.conf"), "port = 80\n").unwrap();
        let engine = Arc::new(MemoryEngine::new().with_container_delay(Duration::from_secs(30)));
        let globals = Globals::default();
        let signals = CancellationRegistry::new();
        let exec = Executor::new(
            engine.clone(),
            PullCoordinator::new(),
            signals.clone(),
            &globals,
            UiContext::non_interactive().with_quiet(true),
        );
        let mut interp = Interpreter::new(exec, HashMap::new(), temp.path());
        interp.from("debian").await.unwrap();
        let base = interp.image_id().to_string();

        let cancel = globals.cancel.clone();
        let (watched_engine, watched_signals) = (engine.clone(), signals.clone());
        let canceller = tokio::spawn(async move {
            loop {
                let files = watched_signals.tracked_files();
                if watched_engine.live_containers() == 1 && files.len() == 1 {
                    assert!(files[0].exists());
                    cancel.cancel();
                    return files[0].clone();
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let err = tokio::time::timeout(
            Duration::from_secs(10),
            interp.copy("app.conf", "/etc/", Vec::new(), None),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_cancelled());

        let archive = canceller.await.unwrap();
        assert!(!archive.exists());
        assert_eq!(signals.file_count(), 0);
        assert_eq!(engine.live_containers(), 0);
        assert_eq!(interp.image_id(), base);
    }

    #[tokio::test]
    async fn copy_rejects_paths_below_build_dir() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        let err = interp
            .copy("../outside", "/", Vec::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("may fall below the root build directory"));
    }

    #[tokio::test]
    async fn funcs_read_the_image() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        assert_eq!(interp.getuid("nobody").await.unwrap(), "65534");
        assert_eq!(interp.getgid("root").await.unwrap(), "0");
        assert!(interp.getuid("ghost").await.is_err());
        assert!(interp.read("/etc/passwd").await.unwrap().contains("root"));
        assert_eq!(interp.var("version").unwrap(), "1.2");
        assert!(matches!(interp.var("nope"), Err(KilnError::VarMissing(_))));

        interp.user("nobody").await.unwrap();
    }

    #[tokio::test]
    async fn tag_commits_and_names_image() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut interp = started(engine.clone(), temp.path()).await;
        interp.set_cache_key(verb_key("run", &["make".into()]));
        interp.run("make", true).await.unwrap();
        interp.tag("app:latest").await.unwrap();
        assert_eq!(engine.lookup("app:latest").await.unwrap(), interp.image_id());
    }

    #[tokio::test]
    async fn save_derives_tag_from_file_name() {
        let temp = TempDir::new().unwrap();
        let engine = Arc::new(MemoryEngine::new());
        let mut interp = started(engine, temp.path()).await;
        interp
            .save(SaveRequest {
                file: Some("out.tar".into()),
                kind: Some("oci".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut archive = tar::Archive::new(fs::File::open(temp.path().join("out.tar")).unwrap());
        let has_ref = archive
            .entries()
            .unwrap()
            .any(|e| e.unwrap().path().unwrap().to_string_lossy() == "refs/out");
        assert!(has_ref);
    }

    #[tokio::test]
    async fn skip_scope_marks_layers() {
        let temp = TempDir::new().unwrap();
        let mut interp = started(Arc::new(MemoryEngine::new()), temp.path()).await;
        let saved = interp.enter_scope(Scope::Skip).unwrap();
        interp.set_cache_key(verb_key("run", &["one".into()]));
        interp.run("one", true).await.unwrap();
        interp.leave_scope(saved);
        assert_eq!(interp.executor().ledger().skipped().len(), 1);
        assert!(!interp.executor().ledger().skip_mode());
    }
}
