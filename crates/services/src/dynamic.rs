//! Runtime wrapper around one [`ServiceDefinition`].
//!
//! On-disk layout under `<services_dir>/<name>/`:
//!
//! ```text
//! repo/            working copy (git clone, or an empty dir for local services)
//! results.txt      cached `run` output, fresh while younger than `cache`
//! instance.id      epoch of the orchestrator that last refreshed the service
//! last_update.dt   RFC 3339 timestamp of the last refresh or scheduled run
//! ```
//!
//! The cache is keyed by service name only: callers with different
//! identities or arguments share one cached result.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    cron::Schedule,
    mememo_auth::{CallContext, Policy},
    mememo_common::{Error, Result},
    mememo_config::ServiceDefinition,
    regex::Regex,
    tokio::{fs, sync::Mutex},
    tracing::{debug, info, warn},
};

use crate::{
    process::CommandRunner,
    schedule::{next_after, parse_schedule},
    service::Service,
    state::{StateKey, StateStore},
};

const RESULTS_FILE: &str = "results.txt";
const REPO_DIR: &str = "repo";

/// Service names double as directory names.
pub fn validate_service_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid service name '{name}': use letters, digits, '-' or '_'"
        )))
    }
}

pub struct DynamicService {
    name: String,
    definition: ServiceDefinition,
    handles: Option<Regex>,
    schedule: Option<Schedule>,
    epoch: String,
    dir: PathBuf,
    /// Config-wide environment, overridden by the definition's own.
    base_env: BTreeMap<String, String>,
    state: Arc<dyn StateStore>,
    commands: CommandRunner,
    git: CommandRunner,
    lock: Mutex<()>,
}

impl DynamicService {
    /// Compile the definition's `handles` regex and `schedule` up front.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        definition: ServiceDefinition,
        epoch: impl Into<String>,
        services_dir: &Path,
        base_env: BTreeMap<String, String>,
        state: Arc<dyn StateStore>,
        commands: CommandRunner,
        git: CommandRunner,
    ) -> Result<Self> {
        let name = name.into();
        validate_service_name(&name)?;
        let handles = definition
            .handles
            .as_deref()
            .map(|pattern| {
                Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
                    Error::validation(format!("service '{name}': invalid handles pattern: {e}"))
                })
            })
            .transpose()?;
        let schedule = definition.schedule.as_deref().map(parse_schedule).transpose()?;
        Ok(Self {
            dir: services_dir.join(&name),
            name,
            definition,
            handles,
            schedule,
            epoch: epoch.into(),
            base_env,
            state,
            commands,
            git,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn repo_dir(&self) -> PathBuf {
        self.dir.join(REPO_DIR)
    }

    fn results_path(&self) -> PathBuf {
        self.dir.join(RESULTS_FILE)
    }

    fn check(&self, ctx: Option<&CallContext>) -> Result<()> {
        match ctx {
            Some(ctx) => Policy::AllGrants(self.definition.required_grants.clone()).check(ctx),
            None => Ok(()),
        }
    }

    fn env(&self, ctx: Option<&CallContext>) -> Result<BTreeMap<String, String>> {
        let mut env = self.base_env.clone();
        env.extend(self.definition.env.clone());
        env.insert("GIT_TERMINAL_PROMPT".into(), "0".into());
        if let Some(ctx) = ctx {
            env.extend(ctx.env()?);
        }
        Ok(env)
    }

    /// Next scheduled firing strictly after `reference`; `None` means never.
    pub fn next_update_time(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .as_ref()
            .and_then(|schedule| next_after(schedule, reference))
    }

    pub async fn last_update(&self) -> Result<Option<DateTime<Utc>>> {
        self.state.get_time(&self.name, StateKey::LastUpdate).await
    }

    /// Whether a scheduled sweep at `now` should run this service.
    pub async fn is_due(&self, now: DateTime<Utc>) -> Result<bool> {
        let reference = self.last_update().await?.unwrap_or(DateTime::UNIX_EPOCH);
        Ok(self.next_update_time(reference).is_some_and(|next| next <= now))
    }

    /// Make sure the working copy exists and is in sync for `epoch`.
    ///
    /// Clones and runs `setup` on first use. Afterwards a refresh (fetch,
    /// hard reset, cache clear, `setup`) happens whenever the stored epoch
    /// differs from `epoch` or the `refresh` interval has elapsed.
    pub async fn prepare(&self, epoch: &str, ctx: Option<&CallContext>) -> Result<()> {
        self.check(ctx)?;
        let _guard = self.lock.lock().await;
        self.prepare_locked(epoch).await
    }

    async fn prepare_locked(&self, epoch: &str) -> Result<()> {
        let repo = self.repo_dir();
        if !fs::try_exists(&repo).await? {
            self.install(&repo).await?;
            return self.mark_refreshed(epoch).await;
        }

        let stored = self.state.get(&self.name, StateKey::Epoch).await?;
        let stale_epoch = stored.as_deref() != Some(epoch);
        let refresh_due = match self.definition.refresh {
            Some(interval) => {
                let last = self.state.get_time(&self.name, StateKey::LastRefresh).await?;
                last.is_none_or(|last| Utc::now() - last >= interval.as_chrono())
            },
            None => false,
        };
        if stale_epoch || refresh_due {
            info!(service = %self.name, epoch, stale_epoch, refresh_due, "refreshing service");
            self.refresh(&repo).await?;
            self.mark_refreshed(epoch).await?;
        }
        Ok(())
    }

    async fn install(&self, repo: &Path) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        match self.definition.repo.as_deref().filter(|_| self.definition.is_remote()) {
            Some(url) => {
                info!(service = %self.name, repo = %url, "cloning service repository");
                let target = repo.to_string_lossy().into_owned();
                if let Err(e) = self.git.git(&["clone", url, target.as_str()], &self.dir).await {
                    // Leave no half-cloned tree behind so the next prepare retries.
                    let _ = fs::remove_dir_all(repo).await;
                    return Err(e);
                }
            },
            None => fs::create_dir_all(repo).await?,
        }
        self.setup(repo).await
    }

    async fn refresh(&self, repo: &Path) -> Result<()> {
        if self.definition.is_remote() {
            self.git.git(&["fetch", "origin"], repo).await?;
            self.git.git(&["reset", "--hard", "@{u}"], repo).await?;
        }
        self.clear_cache().await?;
        self.setup(repo).await
    }

    async fn setup(&self, repo: &Path) -> Result<()> {
        let Some(setup) = self.definition.setup.as_deref() else {
            return Ok(());
        };
        debug!(service = %self.name, "running setup");
        self.commands.shell(setup, repo, &self.env(None)?, None).await?;
        Ok(())
    }

    async fn mark_refreshed(&self, epoch: &str) -> Result<()> {
        let now = Utc::now();
        self.state.set(&self.name, StateKey::Epoch, epoch).await?;
        self.state
            .set_time(&self.name, StateKey::LastRefresh, now)
            .await?;
        self.state
            .set_time(&self.name, StateKey::LastUpdate, now)
            .await
    }

    /// Record a scheduled run that did not necessarily refresh.
    pub async fn mark_updated(&self, at: DateTime<Utc>) -> Result<()> {
        self.state.set_time(&self.name, StateKey::LastUpdate, at).await
    }

    async fn clear_cache(&self) -> Result<()> {
        match fs::remove_file(self.results_path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Cached output if caching is on and the cache file is fresh.
    ///
    /// A stale cache file is deleted.
    async fn cached(&self) -> Result<Option<String>> {
        let Some(max_age) = self.definition.cache else {
            return Ok(None);
        };
        let path = self.results_path();
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let age = meta.modified()?.elapsed().unwrap_or_default();
        if age < max_age.as_duration() {
            return Ok(Some(fs::read_to_string(&path).await?));
        }
        fs::remove_file(&path).await?;
        Ok(None)
    }

    /// Produce the service output for `ctx`.
    ///
    /// Prepares the service for `epoch` if needed, serves a fresh cache hit
    /// or runs `run`, then pipes the output through `respond` when
    /// `want_response` is set.
    pub async fn invoke(
        &self,
        epoch: &str,
        ctx: Option<&CallContext>,
        want_response: bool,
    ) -> Result<String> {
        self.check(ctx)?;
        let _guard = self.lock.lock().await;
        self.prepare_locked(epoch).await?;

        let output = match self.cached().await? {
            Some(hit) => {
                debug!(service = %self.name, "cache hit");
                hit
            },
            None => {
                let started = Instant::now();
                let output = self
                    .commands
                    .shell(&self.definition.run, &self.repo_dir(), &self.env(ctx)?, None)
                    .await?;
                info!(
                    service = %self.name,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "service run finished"
                );
                if self.definition.cache.is_some() {
                    let tmp = self.results_path().with_extension("tmp");
                    fs::write(&tmp, output.as_bytes()).await?;
                    fs::rename(&tmp, self.results_path()).await?;
                }
                output
            },
        };

        match self.definition.respond.as_deref() {
            Some(respond) if want_response => {
                self.commands
                    .shell(respond, &self.repo_dir(), &self.env(ctx)?, Some(&output))
                    .await
            },
            _ => Ok(output),
        }
    }
}

#[async_trait]
impl Service for DynamicService {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles_function(&self, name: &str) -> bool {
        self.handles.as_ref().is_some_and(|re| re.is_match(name))
    }

    fn handles_message(&self, text: &str) -> bool {
        text.split_whitespace()
            .next()
            .is_some_and(|first| self.definition.sigils.iter().any(|s| s == first))
    }

    fn help_text(&self) -> String {
        let usage = self
            .definition
            .usage
            .clone()
            .unwrap_or_else(|| self.name.clone());
        match self.definition.doc.as_deref() {
            Some(doc) => {
                let body: Vec<String> = doc.lines().map(|l| format!("    {l}")).collect();
                format!("{usage}\n{}", body.join("\n"))
            },
            None => usage,
        }
    }

    async fn call(&self, ctx: &CallContext) -> Result<String> {
        match self.invoke(&self.epoch, Some(ctx), true).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if !e.is_caller_fault() {
                    warn!(service = %self.name, error = %e, "service call failed");
                }
                Err(e)
            },
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::state::InMemoryStateStore,
        mememo_auth::User,
        mememo_config::CompactDuration,
        std::time::Duration,
        tokio_util::sync::CancellationToken,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        services_dir: PathBuf,
        state: Arc<InMemoryStateStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            Self {
                services_dir: tmp.path().join("services"),
                _tmp: tmp,
                state: Arc::new(InMemoryStateStore::new()),
            }
        }

        fn scratch(&self, name: &str) -> PathBuf {
            self.services_dir.parent().unwrap().join(name)
        }

        fn service(&self, name: &str, def: ServiceDefinition, epoch: &str) -> DynamicService {
            let runner = CommandRunner::new(Duration::from_secs(30), CancellationToken::new());
            DynamicService::new(
                name,
                def,
                epoch,
                &self.services_dir,
                BTreeMap::new(),
                self.state.clone(),
                runner.clone(),
                runner,
            )
            .unwrap()
        }
    }

    fn count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn counting(def_run: &str, counter: &Path) -> ServiceDefinition {
        let mut def = ServiceDefinition::new(def_run);
        def.env
            .insert("COUNTER".into(), counter.to_string_lossy().into_owned());
        def
    }

    fn caller(grants: &[&str]) -> CallContext {
        CallContext {
            user: User::new("bob"),
            permissions: Default::default(),
            grants: grants.iter().map(|s| s.to_string()).collect(),
            function_name: "hello".into(),
            args: vec!["a b".into()],
        }
    }

    #[tokio::test]
    async fn cached_output_skips_second_run() {
        let fx = Fixture::new();
        let counter = fx.scratch("runs");
        let mut def = counting("echo x >> \"$COUNTER\"; echo hello", &counter);
        def.cache = Some("1m".parse().unwrap());
        let svc = fx.service("hello", def, "epoch-1");

        assert_eq!(svc.invoke("epoch-1", None, true).await.unwrap(), "hello\n");
        assert_eq!(svc.invoke("epoch-1", None, true).await.unwrap(), "hello\n");
        assert_eq!(count(&counter), 1);
        assert!(svc.dir().join("results.txt").exists());
    }

    #[tokio::test]
    async fn stale_cache_reruns() {
        let fx = Fixture::new();
        let counter = fx.scratch("runs");
        let mut def = counting("echo x >> \"$COUNTER\"; echo hello", &counter);
        def.cache = Some(CompactDuration::from_secs(1));
        let svc = fx.service("hello", def, "e");

        svc.invoke("e", None, false).await.unwrap();
        let first_mtime = std::fs::metadata(svc.dir().join("results.txt"))
            .unwrap()
            .modified()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        svc.invoke("e", None, false).await.unwrap();
        let second_mtime = std::fs::metadata(svc.dir().join("results.txt"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(count(&counter), 2);
        assert!(second_mtime > first_mtime);
    }

    #[tokio::test]
    async fn no_cache_always_runs() {
        let fx = Fixture::new();
        let counter = fx.scratch("runs");
        let svc = fx.service("hello", counting("echo x >> \"$COUNTER\"", &counter), "e");
        svc.invoke("e", None, false).await.unwrap();
        svc.invoke("e", None, false).await.unwrap();
        assert_eq!(count(&counter), 2);
        assert!(!svc.dir().join("results.txt").exists());
    }

    #[tokio::test]
    async fn new_epoch_refreshes_exactly_once() {
        let fx = Fixture::new();
        let counter = fx.scratch("setups");
        let mut def = counting("echo ok", &counter);
        def.setup = Some("echo x >> \"$COUNTER\"".into());

        let svc = fx.service("hello", def.clone(), "first");
        svc.prepare("first", None).await.unwrap();
        svc.prepare("first", None).await.unwrap();
        assert_eq!(count(&counter), 1);

        // A restarted orchestrator brings a fresh epoch.
        let svc = fx.service("hello", def, "second");
        svc.prepare("second", None).await.unwrap();
        svc.prepare("second", None).await.unwrap();
        svc.invoke("second", None, false).await.unwrap();
        assert_eq!(count(&counter), 2);
    }

    #[tokio::test]
    async fn refresh_clears_cache() {
        let fx = Fixture::new();
        let counter = fx.scratch("runs");
        let mut def = counting("echo x >> \"$COUNTER\"; echo hi", &counter);
        def.cache = Some("1h".parse().unwrap());
        fx.service("hello", def.clone(), "one")
            .invoke("one", None, false)
            .await
            .unwrap();
        fx.service("hello", def, "two")
            .invoke("two", None, false)
            .await
            .unwrap();
        assert_eq!(count(&counter), 2);
    }

    #[tokio::test]
    async fn refresh_interval_elapsed_triggers_setup() {
        let fx = Fixture::new();
        let counter = fx.scratch("setups");
        let mut def = counting("true", &counter);
        def.setup = Some("echo x >> \"$COUNTER\"".into());
        def.refresh = Some("1h".parse().unwrap());
        let svc = fx.service("hello", def, "e");
        svc.prepare("e", None).await.unwrap();
        fx.state
            .set_time(
                "hello",
                StateKey::LastRefresh,
                Utc::now() - chrono::TimeDelta::hours(2),
            )
            .await
            .unwrap();
        svc.prepare("e", None).await.unwrap();
        svc.prepare("e", None).await.unwrap();
        assert_eq!(count(&counter), 2);
    }

    #[tokio::test]
    async fn scheduled_runs_do_not_postpone_refresh() {
        let fx = Fixture::new();
        let counter = fx.scratch("setups");
        let mut def = counting("true", &counter);
        def.setup = Some("echo x >> \"$COUNTER\"".into());
        def.refresh = Some("1h".parse().unwrap());
        let svc = fx.service("hello", def, "e");
        svc.prepare("e", None).await.unwrap();
        fx.state
            .set_time(
                "hello",
                StateKey::LastRefresh,
                Utc::now() - chrono::TimeDelta::hours(2),
            )
            .await
            .unwrap();

        // A sweep a minute ago moved last_update but not the refresh clock.
        svc.mark_updated(Utc::now() - chrono::TimeDelta::minutes(1))
            .await
            .unwrap();
        svc.prepare("e", None).await.unwrap();
        assert_eq!(count(&counter), 2);
        let last_update = svc.last_update().await.unwrap().unwrap();
        assert!(last_update > Utc::now() - chrono::TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn missing_grants_are_listed() {
        let fx = Fixture::new();
        let mut def = ServiceDefinition::new("echo secret");
        def.required_grants = vec!["vault:read".into(), "vault:list".into()];
        let svc = fx.service("vault", def, "e");

        let err = svc
            .invoke("e", Some(&caller(&["vault:list"])), true)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not authorized, missing: vault:read");
        assert!(!svc.dir().exists());

        let out = svc
            .invoke("e", Some(&caller(&["vault:read", "vault:list"])), true)
            .await
            .unwrap();
        assert_eq!(out, "secret\n");
    }

    #[tokio::test]
    async fn caller_environment_reaches_run() {
        let fx = Fixture::new();
        let def = ServiceDefinition::new(
            "echo \"$MEMEMO_USERNAME|$MEMEMO_ARGS|$GIT_TERMINAL_PROMPT\"",
        );
        let svc = fx.service("env", def, "e");
        let out = svc.invoke("e", Some(&caller(&[])), true).await.unwrap();
        assert_eq!(out, "bob|'a b'|0\n");
    }

    #[tokio::test]
    async fn respond_post_processes_output() {
        let fx = Fixture::new();
        let mut def = ServiceDefinition::new("echo hello");
        def.respond = Some("tr a-z A-Z".into());
        let svc = fx.service("shout", def, "e");
        assert_eq!(svc.invoke("e", None, true).await.unwrap(), "HELLO\n");
        assert_eq!(svc.invoke("e", None, false).await.unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn failing_run_is_external_command_error() {
        let fx = Fixture::new();
        let svc = fx.service("broken", ServiceDefinition::new("exit 7"), "e");
        assert!(matches!(
            svc.invoke("e", None, false).await.unwrap_err(),
            Error::ExternalCommand { code: 7, .. }
        ));
    }

    #[test]
    fn routing_predicates() {
        let fx = Fixture::new();
        let mut def = ServiceDefinition::new("true");
        def.handles = Some("weather|forecast".into());
        def.sigils = vec!["!weather".into()];
        let svc = fx.service("weather", def, "e");
        assert!(svc.handles_function("weather"));
        assert!(svc.handles_function("forecast"));
        assert!(!svc.handles_function("weatherman"));
        assert!(svc.handles_message("!weather nyc"));
        assert!(!svc.handles_message("what is the !weather"));

        let silent = fx.service("silent", ServiceDefinition::new("true"), "e");
        assert!(!silent.handles_function("silent"));
    }

    #[test]
    fn next_update_time_without_schedule_is_never() {
        let fx = Fixture::new();
        let svc = fx.service("x", ServiceDefinition::new("true"), "e");
        assert!(svc.next_update_time(Utc::now()).is_none());

        let mut def = ServiceDefinition::new("true");
        def.schedule = Some("*/5 * * * *".into());
        let svc = fx.service("y", def, "e");
        let now = Utc::now();
        let next = svc.next_update_time(now).unwrap();
        assert!(next > now && next <= now + chrono::TimeDelta::minutes(5));
    }

    #[rstest::rstest]
    #[case("weather", true)]
    #[case("my-svc_2", true)]
    #[case(".manager", false)]
    #[case("../etc", false)]
    #[case("", false)]
    fn service_names(#[case] name: &str, #[case] ok: bool) {
        assert_eq!(validate_service_name(name).is_ok(), ok);
    }

    #[test]
    fn bad_pattern_rejected_at_construction() {
        let fx = Fixture::new();
        let mut def = ServiceDefinition::new("true");
        def.handles = Some("(".into());
        let runner = CommandRunner::new(Duration::from_secs(1), CancellationToken::new());
        let err = DynamicService::new(
            "x",
            def,
            "e",
            &fx.services_dir,
            BTreeMap::new(),
            fx.state.clone(),
            runner.clone(),
            runner,
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Validation { .. }));
    }

    fn git_available() -> bool {
        which::which("git").is_ok()
    }

    async fn git(args: &[&str], cwd: &Path) {
        let status = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[tokio::test]
    async fn clones_and_fast_forwards_on_new_epoch() {
        if !git_available() {
            eprintln!("skipping: git not installed");
            return;
        }
        let fx = Fixture::new();
        let upstream = fx.scratch("upstream");
        std::fs::create_dir_all(&upstream).unwrap();
        git(&["init", "-q", "-b", "main"], &upstream).await;
        std::fs::write(upstream.join("msg.txt"), "v1\n").unwrap();
        git(&["add", "."], &upstream).await;
        git(&["commit", "-q", "-m", "v1"], &upstream).await;

        let mut def = ServiceDefinition::new("cat msg.txt");
        def.repo = Some(upstream.to_string_lossy().into_owned());

        let svc = fx.service("remote", def.clone(), "one");
        assert_eq!(svc.invoke("one", None, false).await.unwrap(), "v1\n");

        std::fs::write(upstream.join("msg.txt"), "v2\n").unwrap();
        git(&["commit", "-q", "-am", "v2"], &upstream).await;

        // Same epoch: no resync.
        assert_eq!(svc.invoke("one", None, false).await.unwrap(), "v1\n");

        let svc = fx.service("remote", def, "two");
        assert_eq!(svc.invoke("two", None, false).await.unwrap(), "v2\n");
    }

    #[tokio::test]
    async fn failed_clone_leaves_no_working_copy() {
        if !git_available() {
            eprintln!("skipping: git not installed");
            return;
        }
        let fx = Fixture::new();
        let mut def = ServiceDefinition::new("true");
        def.repo = Some(fx.scratch("does-not-exist").to_string_lossy().into_owned());
        let svc = fx.service("ghost", def, "e");
        assert!(svc.prepare("e", None).await.is_err());
        assert!(!svc.dir().join("repo").exists());
    }
}
